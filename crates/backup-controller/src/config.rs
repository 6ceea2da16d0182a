//! Controller configuration

use anyhow::{Context, Result};
use backup_lib::Cluster;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the optional config file
pub const CONFIG_PATH_ENV: &str = "BACKUP_CONTROLLER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/backup-controller/config";

/// Controller settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between backup sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// JSON manifest of managed clusters
    #[serde(default)]
    pub clusters_file: Option<PathBuf>,

    /// Command run to save a snapshot; `{cluster}` and `{snapshot}` are
    /// substituted per argument
    #[serde(default = "default_save_command")]
    pub save_command: String,

    /// Command run to remove a snapshot
    #[serde(default = "default_remove_command")]
    pub remove_command: String,

    /// Maximum lifecycle hooks running at once
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    /// Seconds before a failed create hook is retried
    #[serde(default = "default_requeue")]
    pub requeue_secs: u64,

    /// Dial timeout of remote blob store clients
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_save_command() -> String {
    "etcd-snapshot save --cluster {cluster} --name {snapshot}".to_string()
}

fn default_remove_command() -> String {
    "etcd-snapshot delete --cluster {cluster} --name {snapshot}".to_string()
}

fn default_max_concurrent_reconciles() -> usize {
    4
}

fn default_requeue() -> u64 {
    60
}

fn default_remote_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            sweep_interval_secs: default_sweep_interval(),
            clusters_file: None,
            save_command: default_save_command(),
            remove_command: default_remove_command(),
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            requeue_secs: default_requeue(),
            remote_timeout_secs: default_remote_timeout(),
        }
    }
}

impl Settings {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from `path` (any extension the `config` crate understands, or
    /// none), overridden by `BACKUP_*` environment variables
    pub fn load_from(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("BACKUP"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?;

        config
            .try_deserialize()
            .context("invalid controller configuration")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

/// Read the cluster manifest: a JSON array of clusters
pub fn load_clusters(path: &Path) -> Result<Vec<Cluster>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster manifest {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse cluster manifest {}", path.display()))
}
