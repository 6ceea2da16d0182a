//! Backup lifecycle hooks
//!
//! [`BackupReconciler`] implements the create/update/remove callbacks for
//! backup objects. Whatever drives it (the in-process
//! [`crate::controller::LifecycleController`] or another runtime) must
//! serialize calls per object; the reconciler keeps no locks of its own and
//! relies on conditional updates in the object store.

mod create;
mod remove;


use crate::backoff::Backoff;
use crate::error::Result;
use crate::models::Backup;
use crate::observability::{BackupMetrics, StructuredLogger};
use crate::remote::{BlobStoreFactory, DEFAULT_TRANSPORT_TIMEOUT};
use crate::store::{ObjectStore, SnapshotEngine};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Callbacks invoked for backup objects.
///
/// Each returns the possibly mutated object. An error asks the caller to
/// invoke the hook again later.
#[async_trait]
pub trait BackupLifecycle: Send + Sync {
    async fn on_create(&self, backup: Backup) -> Result<Backup>;

    async fn on_update(&self, backup: Backup) -> Result<Backup>;

    /// Runs once when deletion of the object is requested
    async fn on_remove(&self, backup: Backup) -> Result<Backup>;
}

/// Retry and timeout settings of the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Schedule for snapshot save and snapshot removal
    pub snapshot_backoff: Backoff,
    /// Schedule for deleting remote archives
    pub remote_delete_backoff: Backoff,
    /// Dial timeout of remote store clients
    pub remote_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            snapshot_backoff: Backoff::exponential(),
            remote_delete_backoff: Backoff::remote_delete(),
            remote_timeout: DEFAULT_TRANSPORT_TIMEOUT,
        }
    }
}

/// Drives backups through naming, saving and removal
pub struct BackupReconciler {
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn SnapshotEngine>,
    blob_stores: Arc<dyn BlobStoreFactory>,
    config: ReconcilerConfig,
    metrics: BackupMetrics,
    logger: StructuredLogger,
}

impl BackupReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn SnapshotEngine>,
        blob_stores: Arc<dyn BlobStoreFactory>,
    ) -> Self {
        Self {
            store,
            engine,
            blob_stores,
            config: ReconcilerConfig::default(),
            metrics: BackupMetrics::new(),
            logger: StructuredLogger::new("backup-reconciler"),
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }
}

#[async_trait]
impl BackupLifecycle for BackupReconciler {
    async fn on_create(&self, backup: Backup) -> Result<Backup> {
        self.create(backup).await
    }

    async fn on_update(&self, backup: Backup) -> Result<Backup> {
        Ok(backup)
    }

    async fn on_remove(&self, backup: Backup) -> Result<Backup> {
        self.remove(backup).await
    }
}
