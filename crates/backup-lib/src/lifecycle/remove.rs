//! Remove hook: erase the snapshot and its remote archive
//!
//! Both steps are best effort. Failures are logged and the hook still
//! succeeds, so deleting a backup object never gets stuck on cleanup.

use super::BackupReconciler;
use crate::backoff::{retry, retry_if};
use crate::error::Result;
use crate::models::Backup;
use crate::naming::snapshot_name;
use crate::remote::delete_remote_artifact;
use tracing::{info, warn};

impl BackupReconciler {
    pub(super) async fn remove(&self, backup: Backup) -> Result<Backup> {
        info!(backup = %backup.key(), "Deleting backup");

        if let Err(e) = self.remove_snapshot(&backup).await {
            warn!(backup = %backup.name(), error = %e, "Giving up on deleting backup snapshot");
        }

        if backup.remote_target().is_none() {
            return Ok(backup);
        }

        let factory = self.blob_stores.as_ref();
        let timeout = self.config.remote_timeout;
        let backup_ref = &backup;
        let deleted = retry_if(
            &self.config.remote_delete_backoff,
            "remote_delete",
            || delete_remote_artifact(factory, backup_ref, timeout),
            |e| e.is_retryable(),
        )
        .await;

        if let Err(e) = deleted {
            self.metrics.inc_remote_delete_failures();
            warn!(
                backup = %backup.name(),
                error = %e,
                "Giving up on deleting backup from remote store"
            );
        }

        Ok(backup)
    }

    async fn remove_snapshot(&self, backup: &Backup) -> Result<()> {
        let cluster = self.store.get_cluster(&backup.spec.cluster_id).await?;
        let snapshot = snapshot_name(backup);
        let engine = self.engine.as_ref();
        let cluster_ref = &cluster;
        let snapshot_ref = snapshot.as_str();

        retry(&self.config.snapshot_backoff, "snapshot_remove", || {
            engine.remove_snapshot(cluster_ref, snapshot_ref)
        })
        .await
    }
}
