//! Error types for backup lifecycle operations
//!
//! Variants carry the cluster or backup they concern so that a failure
//! recorded on an object, or logged by the sweep, can be traced back to it.

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for backup lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster carries no backup policy; retrying will not help until
    /// the cluster configuration changes.
    #[error("cluster {cluster} doesn't have a backup config")]
    MissingBackupConfig { cluster: String },

    /// The cluster referenced by a backup does not exist
    #[error("cluster {cluster} not found")]
    ClusterNotFound { cluster: String },

    /// The backup object does not exist (or was already purged)
    #[error("backup {namespace}/{name} not found")]
    BackupNotFound { namespace: String, name: String },

    /// Optimistic concurrency conflict on an object update
    #[error("conflict updating {kind} {name}: object has been modified")]
    Conflict { kind: &'static str, name: String },

    /// A single call to the snapshot engine failed
    #[error("snapshot engine error for cluster {cluster}: {message}")]
    Snapshot { cluster: String, message: String },

    /// Saving a snapshot failed after every retry attempt
    #[error("failed to perform backup {backup}: {source}")]
    SaveFailed {
        backup: String,
        #[source]
        source: Box<Error>,
    },

    /// The remote blob store rejected or failed a request
    #[error("remote store error: {message}")]
    RemoteStore { message: String },

    /// A stored filename could not be interpreted as a remote URL
    #[error("URL is not valid: [{url}]")]
    InvalidUrl { url: String },

    /// Custom CA material could not be turned into a trust store
    #[error("TLS configuration error: {message}")]
    Tls { message: String },

    /// Object store or other internal failure
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn snapshot(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Snapshot {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteStore {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for optimistic concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Whether trying the same operation again can succeed.
    ///
    /// A missing backup config stays retryable since the cluster config may
    /// change between invocations. A bad URL or CA bundle only changes when
    /// the object itself does.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::BackupNotFound { .. } | Error::InvalidUrl { .. } | Error::Tls { .. }
        )
    }

    /// Short machine-readable reason recorded on a failed condition
    pub fn reason(&self) -> &'static str {
        match self {
            Error::MissingBackupConfig { .. } => "MissingBackupConfig",
            Error::ClusterNotFound { .. } => "ClusterNotFound",
            Error::BackupNotFound { .. } => "BackupNotFound",
            Error::Conflict { .. } => "Conflict",
            Error::Snapshot { .. } | Error::SaveFailed { .. } => "Error",
            Error::RemoteStore { .. } => "RemoteStoreError",
            Error::InvalidUrl { .. } => "InvalidUrl",
            Error::Tls { .. } => "TlsError",
            Error::Internal { .. } => "InternalError",
        }
    }
}
