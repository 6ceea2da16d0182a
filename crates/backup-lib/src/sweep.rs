//! Periodic backup sweep
//!
//! Every tick lists all clusters and, for each eligible one, creates a new
//! scheduled backup when one is due and then rotates out expired backups.
//! Clusters are handled one after another; a failing cluster is logged and
//! the sweep moves on.

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::{Backup, Cluster};
use crate::naming::new_backup_object;
use crate::observability::{BackupMetrics, StructuredLogger};
use crate::schedule::{expired_backups, is_due, is_eligible};
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// What a sweep did for one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSyncOutcome {
    /// Cluster was deleting or not eligible
    pub skipped: bool,
    /// Name of the backup created this tick
    pub created: Option<String>,
    /// Names of expired backups deleted this tick
    pub rotated: Vec<String>,
}

/// Totals of one sweep over all clusters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub clusters: usize,
    pub skipped: usize,
    pub created: usize,
    pub rotated: usize,
    pub failed: usize,
}

/// Why the sweep creates a backup for a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateReason {
    /// The cluster has no recurring backups yet
    First,
    /// The newest recurring backup is older than the interval
    Due,
}

impl CreateReason {
    fn as_str(&self) -> &'static str {
        match self {
            CreateReason::First => "first",
            CreateReason::Due => "due",
        }
    }
}

/// Timer-driven loop creating and rotating scheduled backups
pub struct SweepScheduler {
    store: Arc<dyn ObjectStore>,
    interval: Duration,
    metrics: BackupMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl SweepScheduler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            interval: DEFAULT_SWEEP_INTERVAL,
            metrics: BackupMetrics::new(),
            logger: StructuredLogger::new("backup-sweep"),
            health: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Run until `shutdown` fires.
    ///
    /// The first sweep happens one interval after start. Shutdown is only
    /// observed between ticks. A failure to list clusters ends the loop
    /// with that error.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting backup sweep loop"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "Backup sweep failed");
                        if let Some(health) = &self.health {
                            health
                                .set_unhealthy(components::SWEEP, format!("cluster listing failed: {}", e))
                                .await;
                        }
                        return Err(e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down backup sweep loop");
                    return Ok(());
                }
            }
        }
    }

    /// One pass over every cluster
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let start = Instant::now();
        let clusters = self.store.list_clusters().await?;
        let mut stats = SweepStats {
            clusters: clusters.len(),
            ..Default::default()
        };

        for cluster in &clusters {
            debug!(cluster = %cluster.name(), "Checking backups for cluster");
            match self.sync_cluster(cluster, now).await {
                Ok(outcome) => {
                    if outcome.skipped {
                        stats.skipped += 1;
                    }
                    if outcome.created.is_some() {
                        stats.created += 1;
                    }
                    stats.rotated += outcome.rotated.len();
                }
                Err(e) if e.is_conflict() => {
                    debug!(cluster = %cluster.name(), error = %e, "Conflict during backup sync, skipping");
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(cluster = %cluster.name(), error = %e, "Cluster backup sync failed");
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.observe_sweep_duration(elapsed.as_secs_f64());
        debug!(
            clusters = stats.clusters,
            created = stats.created,
            rotated = stats.rotated,
            failed = stats.failed,
            elapsed_ms = elapsed.as_millis(),
            "Backup sweep complete"
        );

        if let Some(health) = &self.health {
            if stats.failed > 0 {
                health
                    .set_degraded(
                        components::SWEEP,
                        format!("{} clusters failed to sync", stats.failed),
                    )
                    .await;
            } else {
                health.set_healthy(components::SWEEP).await;
            }
        }

        Ok(stats)
    }

    /// Create-if-due, then rotate, for a single cluster
    pub async fn sync_cluster(
        &self,
        cluster: &Cluster,
        now: DateTime<Utc>,
    ) -> Result<ClusterSyncOutcome> {
        let mut outcome = ClusterSyncOutcome::default();
        if cluster.is_deleting() || !is_eligible(cluster) {
            outcome.skipped = true;
            return Ok(outcome);
        }

        let backups = self.recurring_backups(cluster).await?;

        if backups.is_empty() {
            info!(cluster = %cluster.name(), "Cluster has no backups, creating first backup");
            let created = self.create_backup(cluster, CreateReason::First).await?;
            outcome.created = Some(created.name().to_string());
            return Ok(outcome);
        }

        if is_due(cluster, &backups, now) {
            let created = self.create_backup(cluster, CreateReason::Due).await?;
            outcome.created = Some(created.name().to_string());
        }

        outcome.rotated = self.rotate_expired(cluster, &backups, now).await?;
        Ok(outcome)
    }

    /// Non-manual backups of `cluster`
    async fn recurring_backups(&self, cluster: &Cluster) -> Result<Vec<Backup>> {
        let backups = self.store.list_backups(cluster.name()).await?;
        Ok(backups
            .into_iter()
            .filter(|b| !b.spec.manual && b.spec.cluster_id == cluster.name())
            .collect())
    }

    async fn create_backup(&self, cluster: &Cluster, reason: CreateReason) -> Result<Backup> {
        let created = self
            .store
            .create_backup(new_backup_object(cluster, false))
            .await?;
        self.metrics.inc_backups_created();
        self.logger
            .log_backup_created(cluster.name(), created.name(), reason.as_str());
        Ok(created)
    }

    /// Delete expired backups from the list read before this tick's
    /// creation, so a backup created just now is never considered.
    async fn rotate_expired(
        &self,
        cluster: &Cluster,
        backups: &[Backup],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let Some(policy) = cluster.backup_policy() else {
            return Ok(Vec::new());
        };

        let mut rotated = Vec::new();
        for backup in expired_backups(backups, policy.retention, policy.interval_hours, now) {
            if backup.metadata.deletion_timestamp.is_some() {
                continue;
            }
            self.store
                .delete_backup(backup.namespace(), backup.name())
                .await?;
            self.metrics.inc_backups_rotated();
            self.logger.log_backup_rotated(cluster.name(), backup.name());
            rotated.push(backup.name().to_string());
        }
        Ok(rotated)
    }
}
