//! S3-compatible blob store client
//!
//! Requests are presigned with SigV4 by `rusty-s3` and sent over a reqwest
//! client carrying the TLS trust roots resolved for the target, so a custom
//! CA applies to exactly this client. Ambient credentials come from the
//! standard AWS chain: environment, shared profile, web identity, then
//! instance metadata.

use async_trait::async_trait;
use backup_lib::remote::{
    BlobStore, BlobStoreFactory, BucketLookup, Credentials, RemoteClientSettings,
};
use backup_lib::{Error, Result};
use reqwest::{Client, StatusCode};
use rusty_s3::actions::S3Action;
use rusty_s3::{Bucket, UrlStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Validity of presigned request URLs
const PRESIGN_DURATION: Duration = Duration::from_secs(300);

/// Signing region used when the target names none
const DEFAULT_REGION: &str = "us-east-1";

/// Builds one [`S3BlobStore`] per set of settings
#[derive(Debug, Clone, Default)]
pub struct S3BlobStoreFactory;

impl BlobStoreFactory for S3BlobStoreFactory {
    fn connect(&self, settings: &RemoteClientSettings) -> Result<Arc<dyn BlobStore>> {
        let tls: rustls::ClientConfig = (*settings.tls).clone();
        let client = Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(settings.dial_timeout)
            .tcp_keepalive(Some(settings.keep_alive))
            .build()
            .map_err(|e| Error::remote(format!("failed to build client: {}", e)))?;

        Ok(Arc::new(S3BlobStore::new(client, settings)?))
    }
}

/// Blob store sending presigned S3 requests
pub struct S3BlobStore {
    client: Client,
    endpoint: Url,
    url_style: UrlStyle,
    region: String,
    credentials: Credentials,
}

impl S3BlobStore {
    fn new(client: Client, settings: &RemoteClientSettings) -> Result<Self> {
        let region = if settings.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            settings.region.clone()
        };

        Ok(Self {
            client,
            endpoint: endpoint_url(&settings.endpoint, settings.secure)?,
            url_style: url_style_for(settings),
            region,
            credentials: settings.credentials.clone(),
        })
    }

    fn bucket(&self, name: &str) -> Result<Bucket> {
        Bucket::new(
            self.endpoint.clone(),
            self.url_style,
            name.to_string(),
            self.region.clone(),
        )
        .map_err(|e| Error::remote(format!("invalid bucket {}: {}", name, e)))
    }

    async fn signing_credentials(&self) -> Result<rusty_s3::Credentials> {
        match &self.credentials {
            Credentials::Static {
                access_key,
                secret_key,
            } => Ok(rusty_s3::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
            )),
            Credentials::Ambient => ambient_credentials().await,
        }
    }

    /// Presigned URL listing at most one key; a 404 means no bucket
    fn list_url(&self, bucket: &str, credentials: &rusty_s3::Credentials) -> Result<Url> {
        let bucket = self.bucket(bucket)?;
        let mut action = bucket.list_objects_v2(Some(credentials));
        action.query_mut().insert("max-keys", "1");
        Ok(action.sign(PRESIGN_DURATION))
    }

    fn delete_url(
        &self,
        bucket: &str,
        key: &str,
        credentials: &rusty_s3::Credentials,
    ) -> Result<Url> {
        let bucket = self.bucket(bucket)?;
        Ok(bucket
            .delete_object(Some(credentials), key)
            .sign(PRESIGN_DURATION))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let credentials = self.signing_credentials().await?;
        let url = self.list_url(bucket, &credentials)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::remote(format!("listing bucket {}: {}", bucket, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::remote(format!(
                "listing bucket {} returned {}",
                bucket, status
            ))),
        }
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        let credentials = self.signing_credentials().await?;
        let url = self.delete_url(bucket, key, &credentials)?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| Error::remote(format!("deleting {}/{}: {}", bucket, key, e)))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(bucket = %bucket, key = %key, status = %status, "Remote object removed");
            Ok(())
        } else {
            Err(Error::remote(format!(
                "deleting {}/{} returned {}",
                bucket, key, status
            )))
        }
    }
}

/// Base URL of the store. A bare host gets its scheme from `secure`.
fn endpoint_url(endpoint: &str, secure: bool) -> Result<Url> {
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let scheme = if secure { "https" } else { "http" };
        format!("{}://{}", scheme, endpoint)
    };
    Url::parse(&raw).map_err(|_| Error::InvalidUrl { url: raw })
}

/// Virtual-host addressing for stores that require it and for AWS itself;
/// path style everywhere else
fn url_style_for(settings: &RemoteClientSettings) -> UrlStyle {
    match settings.bucket_lookup {
        BucketLookup::Dns => UrlStyle::VirtualHost,
        BucketLookup::Auto if settings.endpoint.ends_with("amazonaws.com") => {
            UrlStyle::VirtualHost
        }
        BucketLookup::Auto => UrlStyle::Path,
    }
}

/// Resolve credentials from the controller's environment. The chain may
/// reach the instance metadata service, so it runs off the async workers.
async fn ambient_credentials() -> Result<rusty_s3::Credentials> {
    let resolved = tokio::task::spawn_blocking(|| awscreds::Credentials::default())
        .await
        .map_err(|e| Error::internal(format!("credential lookup task failed: {}", e)))?
        .map_err(|e| Error::remote(format!("failed to load ambient credentials: {}", e)))?;

    let (Some(key), Some(secret)) = (resolved.access_key, resolved.secret_key) else {
        return Err(Error::remote("ambient credentials carry no access key"));
    };
    Ok(match resolved.session_token.or(resolved.security_token) {
        Some(token) => rusty_s3::Credentials::new_with_token(key, secret, token),
        None => rusty_s3::Credentials::new(key, secret),
    })
}
