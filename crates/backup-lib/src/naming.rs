//! Backup naming and addressing
//!
//! Generates the storage identifier of a backup (a local archive name or a
//! remote URL), the object name prefix of new backup objects, and the reverse
//! mappings used when a backup is removed.

use crate::error::{Error, Result};
use crate::models::{Backup, BackupPolicy, BackupSpec, Cluster, ObjectMeta};
use chrono::{DateTime, SecondsFormat, Utc};

/// Archive extension of generated snapshots
pub const COMPRESSED_EXTENSION: &str = "zip";

/// Compose the filename (or URL) a backup is stored under.
///
/// Without a policy there is nothing to store and the result is empty.
pub fn generate_backup_filename(
    snapshot_name: &str,
    policy: Option<&BackupPolicy>,
    now: DateTime<Utc>,
) -> String {
    let Some(policy) = policy else {
        return String::new();
    };

    let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut filename = format!("{}_{}.{}", snapshot_name, timestamp, COMPRESSED_EXTENSION);
    if policy.safe_timestamp {
        filename = filename.replace(':', "-");
    }

    match &policy.remote {
        Some(remote) if !remote.folder.is_empty() => format!(
            "https://{}/{}/{}/{}",
            remote.endpoint, remote.bucket, remote.folder, filename
        ),
        Some(remote) => format!("https://{}/{}/{}", remote.endpoint, remote.bucket, filename),
        None => filename,
    }
}

/// Last path segment of a remote backup URL
pub fn filename_from_url(raw: &str) -> Result<String> {
    let invalid = || Error::InvalidUrl {
        url: raw.to_string(),
    };

    let parsed = url::Url::parse(raw).map_err(|_| invalid())?;
    if parsed.host_str().is_none() {
        return Err(invalid());
    }

    parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| s.to_string())
        .ok_or_else(invalid)
}

/// Name under which the snapshot engine knows this backup.
///
/// The base name of the stored filename without its extension, or the
/// backup's own name when no filename has been resolved.
pub fn snapshot_name(backup: &Backup) -> String {
    let filename = &backup.spec.filename;
    if filename.is_empty() {
        return backup.name().to_string();
    }

    let base = filename.rsplit('/').next().unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

/// Object key of a backup's remote artifact, relative to its bucket
pub fn remote_object_key(backup: &Backup, folder: &str) -> String {
    let filename = match filename_from_url(&backup.spec.filename) {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(
                backup = %backup.name(),
                filename = %backup.spec.filename,
                error = %e,
                "Could not get filename from URL, using backup name as fallback"
            );
            backup.name().to_string()
        }
    };

    if folder.is_empty() {
        filename
    } else {
        format!("{}/{}", folder, filename)
    }
}

/// Generate-name prefix: `<cluster>-<r|m><l|s>-`
pub fn backup_name_prefix(cluster: &Cluster, manual: bool) -> String {
    let type_flag = if manual { "m" } else { "r" };
    let provider_flag = match cluster.backup_policy() {
        Some(policy) if policy.remote.is_some() => "s",
        _ => "l",
    };
    format!("{}-{}{}-", cluster.name(), type_flag, provider_flag)
}

/// A fresh, unnamed backup object for `cluster`.
///
/// The object store assigns the final name from the generate-name prefix.
pub fn new_backup_object(cluster: &Cluster, manual: bool) -> Backup {
    Backup {
        metadata: ObjectMeta {
            namespace: cluster.name().to_string(),
            generate_name: Some(backup_name_prefix(cluster, manual)),
            owner: Some(cluster.name().to_string()),
            ..Default::default()
        },
        spec: BackupSpec {
            cluster_id: cluster.name().to_string(),
            manual,
            ..Default::default()
        },
        status: Default::default(),
    }
}
