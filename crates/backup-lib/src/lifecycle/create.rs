//! Create hook: name the backup, then save the snapshot
//!
//! Phases move `PendingNaming -> PendingSave -> Succeeded | Failed` and each
//! step is persisted before the next begins. A crash during the save leaves
//! the backup in `PendingSave`; the next invocation skips naming and saves
//! again under the same snapshot name.

use super::BackupReconciler;
use crate::backoff::retry;
use crate::error::{Error, Result};
use crate::models::{Backup, Cluster};
use crate::naming::{generate_backup_filename, snapshot_name};
use chrono::Utc;
use tracing::{debug, info};

impl BackupReconciler {
    pub(super) async fn create(&self, backup: Backup) -> Result<Backup> {
        if backup.is_terminal() {
            debug!(backup = %backup.key(), phase = %backup.phase(), "Backup already finished");
            return Ok(backup);
        }

        let cluster = self.store.get_cluster(&backup.spec.cluster_id).await?;
        let Some(policy) = cluster.backup_policy() else {
            return Err(Error::MissingBackupConfig {
                cluster: cluster.name().to_string(),
            });
        };

        let mut backup = backup;
        if !backup.is_created() {
            let filename = generate_backup_filename(backup.name(), Some(policy), Utc::now());
            backup.mark_created(filename, policy.clone(), Utc::now());
            backup = self.store.update_backup(backup).await?;
            self.logger
                .log_backup_named(backup.name(), &backup.spec.filename);
        }

        self.save(backup, &cluster).await
    }

    /// Save through the snapshot backoff and persist the outcome.
    ///
    /// A failed save is recorded as Completed=False before the error is
    /// returned.
    async fn save(&self, mut backup: Backup, cluster: &Cluster) -> Result<Backup> {
        let snapshot = snapshot_name(&backup);
        let engine = self.engine.as_ref();
        let snapshot_ref = snapshot.as_str();

        info!(
            backup = %backup.key(),
            cluster = %cluster.name(),
            snapshot = %snapshot,
            "Saving snapshot"
        );

        let outcome = retry(&self.config.snapshot_backoff, "snapshot_save", || {
            engine.save(cluster, snapshot_ref)
        })
        .await;

        match outcome {
            Ok(()) => {
                backup.mark_succeeded(Utc::now());
                let backup = self.store.update_backup(backup).await?;
                self.metrics.inc_saves_succeeded();
                self.logger.log_backup_completed(backup.name(), true, None);
                Ok(backup)
            }
            Err(e) => {
                let message = e.to_string();
                backup.mark_failed(e.reason(), message.clone(), Utc::now());
                let backup = self.store.update_backup(backup).await?;
                self.metrics.inc_saves_failed();
                self.logger
                    .log_backup_completed(backup.name(), false, Some(&message));
                Err(Error::SaveFailed {
                    backup: backup.name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}
