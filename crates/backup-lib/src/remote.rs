//! Remote blob store access for off-cluster backup archives
//!
//! A client is built per removal from the policy frozen onto the backup:
//! - endpoint defaults to the public S3 endpoint
//! - missing credentials mean ambient (instance role) authentication
//! - a custom CA replaces the trust roots for that client only

use crate::error::{Error, Result};
use crate::models::{Backup, RemoteTarget};
use crate::naming::remote_object_key;
use async_trait::async_trait;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use std::fmt;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Endpoint used when the target does not name one
pub const DEFAULT_ENDPOINT: &str = "s3.amazonaws.com";

/// Dial timeout of remote store connections
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keep-alive of remote store connections
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// How the remote client authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Static {
        access_key: String,
        secret_key: String,
    },
    /// Resolved from the environment the controller runs in
    Ambient,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Static { access_key, .. } => f
                .debug_struct("Static")
                .field("access_key", access_key)
                .finish_non_exhaustive(),
            Credentials::Ambient => write!(f, "Ambient"),
        }
    }
}

/// Bucket addressing style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketLookup {
    /// Let the client pick path or virtual-host style
    Auto,
    /// Always virtual-host style
    Dns,
}

/// Everything needed to construct a remote client
#[derive(Clone)]
pub struct RemoteClientSettings {
    pub endpoint: String,
    pub credentials: Credentials,
    pub region: String,
    pub bucket_lookup: BucketLookup,
    pub secure: bool,
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    pub custom_ca: bool,
    pub tls: Arc<ClientConfig>,
}

impl fmt::Debug for RemoteClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClientSettings")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("region", &self.region)
            .field("bucket_lookup", &self.bucket_lookup)
            .field("secure", &self.secure)
            .field("dial_timeout", &self.dial_timeout)
            .field("custom_ca", &self.custom_ca)
            .finish_non_exhaustive()
    }
}

impl RemoteClientSettings {
    pub fn from_target(target: &RemoteTarget, dial_timeout: Duration) -> Result<Self> {
        let credentials = if target.access_key.is_empty() || target.secret_key.is_empty() {
            Credentials::Ambient
        } else {
            Credentials::Static {
                access_key: target.access_key.clone(),
                secret_key: target.secret_key.clone(),
            }
        };

        let endpoint = if target.endpoint.is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            target.endpoint.clone()
        };

        let custom_ca = !target.custom_ca.is_empty();
        let tls = if custom_ca {
            custom_ca_tls_config(&target.custom_ca)?
        } else {
            default_tls_config()
        };

        Ok(Self {
            bucket_lookup: bucket_lookup_for(&endpoint),
            endpoint,
            credentials,
            region: target.region.clone(),
            secure: true,
            dial_timeout,
            keep_alive: DEFAULT_KEEP_ALIVE,
            custom_ca,
            tls: Arc::new(tls),
        })
    }
}

/// Aliyun OSS only supports virtual-host style addressing
pub fn bucket_lookup_for(endpoint: &str) -> BucketLookup {
    if endpoint.contains("aliyun") {
        BucketLookup::Dns
    } else {
        BucketLookup::Auto
    }
}

/// TLS client config trusting the bundled web PKI roots
pub fn default_tls_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// TLS client config trusting only the certificates in `pem`
pub fn custom_ca_tls_config(pem: &str) -> Result<ClientConfig> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| Error::Tls {
        message: format!("failed to read custom CA: {}", e),
    })?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&certs[..]);
    if added == 0 {
        return Err(Error::Tls {
            message: format!("custom CA contains no usable certificates ({} ignored)", ignored),
        });
    }
    debug!(added, ignored, "Loaded custom CA for remote store");

    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Operations used on a remote blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Builds blob store clients from resolved settings
pub trait BlobStoreFactory: Send + Sync {
    fn connect(&self, settings: &RemoteClientSettings) -> Result<Arc<dyn BlobStore>>;
}

/// One attempt at deleting the remote archive of `backup`.
///
/// A missing bucket means there is nothing left to delete.
pub async fn delete_remote_artifact(
    factory: &dyn BlobStoreFactory,
    backup: &Backup,
    dial_timeout: Duration,
) -> Result<()> {
    let target = backup
        .remote_target()
        .ok_or_else(|| Error::remote("can't find remote backup target configuration"))?;

    let settings = RemoteClientSettings::from_target(target, dial_timeout)?;
    let client = factory.connect(&settings)?;

    let exists = client
        .bucket_exists(&target.bucket)
        .await
        .map_err(|e| Error::remote(format!("can't access bucket: {}", e)))?;
    if !exists {
        error!(bucket = %target.bucket, backup = %backup.name(), "Bucket doesn't exist");
        return Ok(());
    }

    let key = remote_object_key(backup, &target.folder);
    debug!(bucket = %target.bucket, key = %key, "Removing remote backup archive");
    client.remove_object(&target.bucket, &key).await
}
