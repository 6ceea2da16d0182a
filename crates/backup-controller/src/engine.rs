//! Snapshot engine backed by external commands

use async_trait::async_trait;
use backup_lib::{Cluster, Error, Result, SnapshotEngine};
use tokio::process::Command;
use tracing::debug;

/// Environment variable carrying the cluster's engine configuration as JSON
pub const CLUSTER_SPEC_ENV: &str = "CLUSTER_SPEC";

/// Runs one configured command per save or removal.
///
/// Arguments are split on whitespace; `{cluster}` and `{snapshot}` inside
/// any argument are replaced before the command runs.
#[derive(Debug, Clone)]
pub struct CommandSnapshotEngine {
    save: Vec<String>,
    remove: Vec<String>,
}

impl CommandSnapshotEngine {
    pub fn new(save_command: &str, remove_command: &str) -> Self {
        Self {
            save: split_command(save_command),
            remove: split_command(remove_command),
        }
    }

    async fn run(&self, template: &[String], cluster: &Cluster, snapshot_name: &str) -> Result<()> {
        let args = render(template, cluster.name(), snapshot_name);
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::snapshot(cluster.name(), "no snapshot command configured"));
        };

        let spec = serde_json::to_string(&cluster.spec.engine_config)
            .map_err(|e| Error::snapshot(cluster.name(), e.to_string()))?;

        debug!(cluster = %cluster.name(), command = %args.join(" "), "Running snapshot command");
        let output = Command::new(program)
            .args(rest)
            .env(CLUSTER_SPEC_ENV, spec)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::snapshot(cluster.name(), format!("failed to run {}: {}", program, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::snapshot(
            cluster.name(),
            format!("{} exited with {}: {}", program, output.status, stderr.trim()),
        ))
    }
}

#[async_trait]
impl SnapshotEngine for CommandSnapshotEngine {
    async fn save(&self, cluster: &Cluster, snapshot_name: &str) -> Result<()> {
        self.run(&self.save, cluster, snapshot_name).await
    }

    async fn remove_snapshot(&self, cluster: &Cluster, snapshot_name: &str) -> Result<()> {
        self.run(&self.remove, cluster, snapshot_name).await
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

fn render(template: &[String], cluster: &str, snapshot: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace("{cluster}", cluster).replace("{snapshot}", snapshot))
        .collect()
}
