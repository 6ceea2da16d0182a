//! Observability infrastructure for the backup controller
//!
//! Provides:
//! - Prometheus metrics (backups created, save outcomes, rotation, sweep latency)
//! - Structured JSON logging of backup lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, Encoder, Histogram, IntCounter, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sweep duration (in seconds)
const SWEEP_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<BackupMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct BackupMetricsInner {
    backups_created: IntCounter,
    saves_succeeded: IntCounter,
    saves_failed: IntCounter,
    backups_rotated: IntCounter,
    remote_delete_failures: IntCounter,
    sweep_duration_seconds: Histogram,
}

impl BackupMetricsInner {
    fn new() -> Self {
        Self {
            backups_created: register_int_counter!(
                "backup_controller_backups_created_total",
                "Scheduled backup objects created by the sweep"
            )
            .expect("Failed to register backups_created"),

            saves_succeeded: register_int_counter!(
                "backup_controller_saves_succeeded_total",
                "Snapshot saves that completed successfully"
            )
            .expect("Failed to register saves_succeeded"),

            saves_failed: register_int_counter!(
                "backup_controller_saves_failed_total",
                "Snapshot saves that exhausted every retry attempt"
            )
            .expect("Failed to register saves_failed"),

            backups_rotated: register_int_counter!(
                "backup_controller_backups_rotated_total",
                "Expired backups deleted by rotation"
            )
            .expect("Failed to register backups_rotated"),

            remote_delete_failures: register_int_counter!(
                "backup_controller_remote_delete_failures_total",
                "Remote archive deletions abandoned after retries"
            )
            .expect("Failed to register remote_delete_failures"),

            sweep_duration_seconds: register_histogram!(
                "backup_controller_sweep_duration_seconds",
                "Time spent in one backup sweep over all clusters",
                SWEEP_BUCKETS.to_vec()
            )
            .expect("Failed to register sweep_duration_seconds"),
        }
    }
}

/// Backup metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct BackupMetrics {
    _private: (),
}

impl Default for BackupMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BackupMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BackupMetricsInner {
        GLOBAL_METRICS.get_or_init(BackupMetricsInner::new)
    }

    pub fn inc_backups_created(&self) {
        self.inner().backups_created.inc();
    }

    pub fn inc_saves_succeeded(&self) {
        self.inner().saves_succeeded.inc();
    }

    pub fn inc_saves_failed(&self) {
        self.inner().saves_failed.inc();
    }

    pub fn inc_backups_rotated(&self) {
        self.inner().backups_rotated.inc();
    }

    pub fn inc_remote_delete_failures(&self) {
        self.inner().remote_delete_failures.inc();
    }

    pub fn observe_sweep_duration(&self, duration_secs: f64) {
        self.inner().sweep_duration_seconds.observe(duration_secs);
    }

    pub fn backups_created(&self) -> u64 {
        self.inner().backups_created.get()
    }

    /// Every metric in the default registry, in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for backup lifecycle events
///
/// Emits one consistently shaped record per lifecycle transition so log
/// pipelines can follow a backup from creation to removal.
#[derive(Clone)]
pub struct StructuredLogger {
    controller: String,
}

impl StructuredLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    /// Log a scheduled backup object being created
    pub fn log_backup_created(&self, cluster: &str, backup: &str, reason: &str) {
        info!(
            event = "backup_created",
            controller = %self.controller,
            cluster = %cluster,
            backup = %backup,
            reason = %reason,
            "New backup created"
        );
    }

    /// Log a backup that has been named and is about to be saved
    pub fn log_backup_named(&self, backup: &str, filename: &str) {
        info!(
            event = "backup_named",
            controller = %self.controller,
            backup = %backup,
            filename = %filename,
            "Backup filename resolved"
        );
    }

    /// Log the terminal outcome of a save
    pub fn log_backup_completed(&self, backup: &str, success: bool, message: Option<&str>) {
        if success {
            info!(
                event = "backup_completed",
                controller = %self.controller,
                backup = %backup,
                "Backup saved successfully"
            );
        } else {
            warn!(
                event = "backup_failed",
                controller = %self.controller,
                backup = %backup,
                message = message.unwrap_or_default(),
                "Backup save failed after retries"
            );
        }
    }

    /// Log an expired backup being deleted by rotation
    pub fn log_backup_rotated(&self, cluster: &str, backup: &str) {
        info!(
            event = "backup_rotated",
            controller = %self.controller,
            cluster = %cluster,
            backup = %backup,
            "Expired backup deleted"
        );
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str, sweep_interval_secs: u64) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            sweep_interval_secs = sweep_interval_secs,
            "Backup controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Backup controller shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_metrics_creation() {
        let metrics = BackupMetrics::new();

        let before = metrics.backups_created();
        metrics.inc_backups_created();
        metrics.inc_saves_succeeded();
        metrics.inc_saves_failed();
        metrics.inc_backups_rotated();
        metrics.inc_remote_delete_failures();
        metrics.observe_sweep_duration(0.25);

        // other tests share the global registry
        assert!(metrics.backups_created() > before);
    }

    #[test]
    fn test_render_includes_backup_metrics() {
        let metrics = BackupMetrics::new();
        metrics.inc_backups_rotated();

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE backup_controller_backups_rotated_total counter"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("backup-controller");
        assert_eq!(logger.controller, "backup-controller");
    }
}
