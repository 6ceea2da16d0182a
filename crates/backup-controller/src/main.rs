//! Backup controller - scheduled etcd snapshots for managed clusters
//!
//! Runs the periodic backup sweep and the per-backup lifecycle hooks
//! against an in-process object store seeded from a cluster manifest.

use anyhow::{Context, Result};
use backup_lib::{
    health::{components, HealthRegistry},
    observability::{BackupMetrics, StructuredLogger},
    BackupReconciler, ControllerConfig, LifecycleController, MemoryObjectStore, ReconcilerConfig,
    SweepScheduler,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod blob;
mod config;
mod engine;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting backup-controller");

    let settings = config::Settings::load()?;
    info!(
        api_port = settings.api_port,
        sweep_interval_secs = settings.sweep_interval_secs,
        "Controller configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SWEEP).await;
    health_registry.register(components::LIFECYCLE).await;

    let metrics = BackupMetrics::new();
    let logger = StructuredLogger::new("backup-controller");
    logger.log_startup(CONTROLLER_VERSION, settings.sweep_interval_secs);

    let clusters = match &settings.clusters_file {
        Some(path) => config::load_clusters(path)?,
        None => {
            warn!("No clusters_file configured, starting without clusters");
            Vec::new()
        }
    };
    info!(clusters = clusters.len(), "Loaded cluster manifest");
    let store = Arc::new(MemoryObjectStore::with_clusters(clusters));
    // subscribe before anything can write so no event is missed
    let events = store.subscribe();

    let engine = Arc::new(engine::CommandSnapshotEngine::new(
        &settings.save_command,
        &settings.remove_command,
    ));
    let blob_stores = Arc::new(blob::S3BlobStoreFactory);
    let reconciler = BackupReconciler::new(store.clone(), engine, blob_stores)
        .with_config(ReconcilerConfig {
            remote_timeout: settings.remote_timeout(),
            ..Default::default()
        })
        .with_logger(logger.clone());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let controller = LifecycleController::with_health(
        store.clone(),
        Arc::new(reconciler),
        ControllerConfig {
            max_concurrent: settings.max_concurrent_reconciles,
            requeue_after: settings.requeue_after(),
        },
        health_registry.clone(),
    );
    let controller_handle = tokio::spawn(controller.run(events, shutdown_tx.subscribe()));

    let sweep = SweepScheduler::new(store.clone())
        .with_interval(settings.sweep_interval())
        .with_health(health_registry.clone())
        .with_logger(logger.clone());
    let sweep_shutdown = shutdown_tx.subscribe();
    let mut sweep_handle = tokio::spawn(async move { sweep.run(sweep_shutdown).await });

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    health_registry.set_ready(true).await;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
            Ok(())
        }
        joined = &mut sweep_handle => {
            let result = joined
                .context("sweep task panicked")
                .and_then(|r| r.map_err(anyhow::Error::from));
            if let Err(e) = &result {
                error!(error = %e, "Backup sweep stopped");
                logger.log_shutdown("sweep stopped");
            }
            result
        }
    };

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = controller_handle.await {
        warn!(error = %e, "Lifecycle controller task failed");
    }
    // still pending only when shutdown came from the signal
    if !sweep_handle.is_finished() {
        if let Err(e) = sweep_handle.await {
            warn!(error = %e, "Sweep task failed");
        }
    }
    api_handle.abort();
    info!("Shutting down");

    outcome
}
