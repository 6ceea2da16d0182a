//! In-process runtime for backup lifecycle hooks
//!
//! Consumes backup events from the object store and invokes the matching
//! [`BackupLifecycle`] hook on its own task, so a slow save never blocks
//! the event loop. Calls are serialized per object and bounded by a
//! semaphore; a task only takes a worker slot once it holds its object's
//! lock. Reconciles already queued for an object absorb later events for
//! it, since each one re-reads the latest version. Create hooks failing
//! with a retryable error are requeued after a delay.

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::lifecycle::BackupLifecycle;
use crate::models::Backup;
use crate::store::{BackupEvent, ObjectStore};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Configuration for the lifecycle controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum hooks running at once
    pub max_concurrent: usize,
    /// Delay before a failed create hook runs again
    pub requeue_after: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            requeue_after: Duration::from_secs(60),
        }
    }
}

/// A unit of work for one backup object
#[derive(Debug, Clone)]
enum Work {
    /// Re-read the object and run the create or update hook
    Reconcile { namespace: String, name: String },
    /// Run the remove hook, then purge the object
    Remove(Backup),
}

impl Work {
    fn key(&self) -> String {
        match self {
            Work::Reconcile { namespace, name } => format!("{}/{}", namespace, name),
            Work::Remove(backup) => backup.key(),
        }
    }
}

impl From<BackupEvent> for Work {
    fn from(event: BackupEvent) -> Self {
        match event {
            BackupEvent::Applied(b) => Work::Reconcile {
                namespace: b.metadata.namespace,
                name: b.metadata.name,
            },
            BackupEvent::Deleted(b) => Work::Remove(b),
        }
    }
}

/// Shared state of in-flight work
struct Dispatch {
    store: Arc<dyn ObjectStore>,
    lifecycle: Arc<dyn BackupLifecycle>,
    config: ControllerConfig,
    permits: Semaphore,
    /// Per-object locks serializing hook calls
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Objects with a reconcile queued but not yet started
    queued: DashSet<String>,
    requeue_tx: mpsc::UnboundedSender<Work>,
    health: Option<HealthRegistry>,
}

/// Event-driven dispatcher of backup lifecycle hooks
pub struct LifecycleController {
    dispatch: Arc<Dispatch>,
    requeue_rx: mpsc::UnboundedReceiver<Work>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        lifecycle: Arc<dyn BackupLifecycle>,
        config: ControllerConfig,
    ) -> Self {
        Self::build(store, lifecycle, config, None)
    }

    pub fn with_health(
        store: Arc<dyn ObjectStore>,
        lifecycle: Arc<dyn BackupLifecycle>,
        config: ControllerConfig,
        health: HealthRegistry,
    ) -> Self {
        Self::build(store, lifecycle, config, Some(health))
    }

    fn build(
        store: Arc<dyn ObjectStore>,
        lifecycle: Arc<dyn BackupLifecycle>,
        config: ControllerConfig,
        health: Option<HealthRegistry>,
    ) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            dispatch: Arc::new(Dispatch {
                store,
                lifecycle,
                config,
                permits,
                locks: DashMap::new(),
                queued: DashSet::new(),
                requeue_tx,
                health,
            }),
            requeue_rx,
        }
    }

    /// Process events until `shutdown` fires or the event stream ends.
    ///
    /// In-flight hooks are awaited before returning.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BackupEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            max_concurrent = self.dispatch.config.max_concurrent,
            "Starting backup lifecycle controller"
        );

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.spawn(&mut tasks, Work::from(event)),
                    None => {
                        debug!("Backup event stream closed");
                        break;
                    }
                },
                Some(work) = self.requeue_rx.recv() => self.spawn(&mut tasks, work),
                _ = shutdown.recv() => {
                    info!("Shutting down backup lifecycle controller");
                    break;
                }
                // reap finished tasks so the set does not grow unbounded
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, work: Work) {
        if matches!(work, Work::Reconcile { .. }) && !self.dispatch.queued.insert(work.key()) {
            debug!(backup = %work.key(), "Reconcile already queued");
            return;
        }
        let dispatch = self.dispatch.clone();
        tasks.spawn(async move { dispatch.handle(work).await });
    }
}

impl Dispatch {
    async fn handle(self: Arc<Self>, work: Work) {
        let key = work.key();
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // waiting on the object lock must not hold a worker slot
        let _guard = lock.lock().await;
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        match work {
            Work::Reconcile { namespace, name } => {
                // events from here on need another pass
                self.queued.remove(&key);
                if let Err(e) = self.reconcile(&namespace, &name).await {
                    if e.is_conflict() {
                        // a newer version of the object produced its own event
                        debug!(backup = %key, error = %e, "Conflict reconciling backup");
                    } else if e.is_retryable() {
                        warn!(
                            backup = %key,
                            error = %e,
                            requeue_secs = self.config.requeue_after.as_secs(),
                            "Backup reconcile failed, requeueing"
                        );
                        self.report(false).await;
                        self.requeue(Work::Reconcile { namespace, name });
                    } else {
                        error!(
                            backup = %key,
                            error = %e,
                            "Backup reconcile failed permanently, waiting for the backup to change"
                        );
                        self.report(false).await;
                    }
                } else {
                    self.report(true).await;
                }
            }
            Work::Remove(backup) => {
                self.remove(backup).await;
                drop(_guard);
                self.locks.remove(&key);
            }
        }
    }

    async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        // always act on the latest stored version, not the event payload
        let backup = match self.store.get_backup(namespace, name).await {
            Ok(b) => b,
            Err(crate::Error::BackupNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if backup.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        if backup.is_terminal() {
            self.lifecycle.on_update(backup).await?;
        } else {
            self.lifecycle.on_create(backup).await?;
        }
        Ok(())
    }

    async fn remove(&self, backup: Backup) {
        let namespace = backup.namespace().to_string();
        let name = backup.name().to_string();

        if let Err(e) = self.lifecycle.on_remove(backup).await {
            warn!(backup = %name, error = %e, "Remove hook failed");
        }
        if let Err(e) = self.store.finalize_backup(&namespace, &name).await {
            warn!(backup = %name, error = %e, "Failed to purge backup object");
        }
    }

    fn requeue(&self, work: Work) {
        let tx = self.requeue_tx.clone();
        let delay = self.config.requeue_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(work);
        });
    }

    async fn report(&self, ok: bool) {
        if let Some(health) = &self.health {
            if ok {
                health.set_healthy(components::LIFECYCLE).await;
            } else {
                health
                    .set_degraded(components::LIFECYCLE, "backup reconcile failures")
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupPolicy, BackupSpec};
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lifecycle that counts calls and completes backups immediately
    struct CountingLifecycle {
        store: Arc<MemoryObjectStore>,
        creates: AtomicUsize,
        removes: AtomicUsize,
        fail_creates: usize,
    }

    #[async_trait]
    impl BackupLifecycle for CountingLifecycle {
        async fn on_create(&self, mut backup: Backup) -> Result<Backup> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_creates {
                return Err(crate::Error::internal("transient"));
            }
            backup.mark_succeeded(chrono::Utc::now());
            self.store.update_backup(backup).await
        }

        async fn on_update(&self, backup: Backup) -> Result<Backup> {
            Ok(backup)
        }

        async fn on_remove(&self, backup: Backup) -> Result<Backup> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(backup)
        }
    }

    fn unnamed() -> Backup {
        Backup {
            metadata: crate::models::ObjectMeta {
                namespace: "c1".to_string(),
                generate_name: Some("c1-rl-".to_string()),
                ..Default::default()
            },
            spec: BackupSpec {
                cluster_id: "c1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_remove() {
        let store = Arc::new(MemoryObjectStore::new());
        let lifecycle = Arc::new(CountingLifecycle {
            store: store.clone(),
            creates: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            fail_creates: 0,
        });
        let events = store.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let controller =
            LifecycleController::new(store.clone(), lifecycle.clone(), ControllerConfig::default());
        let handle = tokio::spawn(controller.run(events, shutdown_rx));

        let created = store.create_backup(unnamed()).await.unwrap();
        settle().await;

        let stored = store.get_backup("c1", created.name()).await.unwrap();
        assert!(stored.is_terminal());
        // the update emitted by the hook is seen as terminal and not re-created
        assert_eq!(lifecycle.creates.load(Ordering::SeqCst), 1);

        store.delete_backup("c1", created.name()).await.unwrap();
        settle().await;
        assert_eq!(lifecycle.removes.load(Ordering::SeqCst), 1);
        assert!(store.get_backup("c1", created.name()).await.is_err());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    /// Lifecycle that persists naming, then takes ten seconds to save
    struct SlowSaveLifecycle {
        store: Arc<MemoryObjectStore>,
        saving: AtomicUsize,
        saved: AtomicUsize,
    }

    #[async_trait]
    impl BackupLifecycle for SlowSaveLifecycle {
        async fn on_create(&self, mut backup: Backup) -> Result<Backup> {
            let filename = format!("{}.zip", backup.name());
            backup.mark_created(filename, BackupPolicy::default(), chrono::Utc::now());
            let mut backup = self.store.update_backup(backup).await?;

            self.saving.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.saving.fetch_sub(1, Ordering::SeqCst);
            self.saved.fetch_add(1, Ordering::SeqCst);

            backup.mark_succeeded(chrono::Utc::now());
            self.store.update_backup(backup).await
        }

        async fn on_update(&self, backup: Backup) -> Result<Backup> {
            Ok(backup)
        }

        async fn on_remove(&self, backup: Backup) -> Result<Backup> {
            Ok(backup)
        }
    }

    /// Lifecycle whose create hook always fails with `error`
    struct FailingLifecycle {
        error: fn() -> crate::Error,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl BackupLifecycle for FailingLifecycle {
        async fn on_create(&self, _backup: Backup) -> Result<Backup> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }

        async fn on_update(&self, backup: Backup) -> Result<Backup> {
            Ok(backup)
        }

        async fn on_remove(&self, backup: Backup) -> Result<Backup> {
            Ok(backup)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_saving_backup_does_not_starve_others() {
        let store = Arc::new(MemoryObjectStore::new());
        let lifecycle = Arc::new(SlowSaveLifecycle {
            store: store.clone(),
            saving: AtomicUsize::new(0),
            saved: AtomicUsize::new(0),
        });
        let events = store.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = ControllerConfig {
            max_concurrent: 2,
            requeue_after: Duration::from_secs(60),
        };
        let controller = LifecycleController::new(store.clone(), lifecycle.clone(), config);
        let handle = tokio::spawn(controller.run(events, shutdown_rx));

        let first = store.create_backup(unnamed()).await.unwrap();
        settle().await;
        // the naming update of the first backup is already queued
        assert_eq!(lifecycle.saving.load(Ordering::SeqCst), 1);

        let second = store.create_backup(unnamed()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(lifecycle.saving.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(lifecycle.saved.load(Ordering::SeqCst), 2);
        assert!(store.get_backup("c1", first.name()).await.unwrap().is_terminal());
        assert!(store.get_backup("c1", second.name()).await.unwrap().is_terminal());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_requeued() {
        let store = Arc::new(MemoryObjectStore::new());
        let lifecycle = Arc::new(FailingLifecycle {
            error: || crate::Error::InvalidUrl {
                url: "::not-a-url".to_string(),
            },
            creates: AtomicUsize::new(0),
        });
        let health = HealthRegistry::new();
        health.register(components::LIFECYCLE).await;
        let events = store.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = ControllerConfig {
            max_concurrent: 2,
            requeue_after: Duration::from_secs(10),
        };
        let controller =
            LifecycleController::with_health(store.clone(), lifecycle.clone(), config, health.clone());
        let handle = tokio::spawn(controller.run(events, shutdown_rx));

        store.create_backup(unnamed()).await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(lifecycle.creates.load(Ordering::SeqCst), 1);
        let status = health.health().await.components[components::LIFECYCLE].status;
        assert_eq!(status, crate::health::ComponentStatus::Degraded);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_is_requeued() {
        let store = Arc::new(MemoryObjectStore::new());
        let lifecycle = Arc::new(CountingLifecycle {
            store: store.clone(),
            creates: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            fail_creates: 1,
        });
        let events = store.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = ControllerConfig {
            max_concurrent: 2,
            requeue_after: Duration::from_secs(10),
        };
        let controller = LifecycleController::new(store.clone(), lifecycle.clone(), config);
        let handle = tokio::spawn(controller.run(events, shutdown_rx));

        let created = store.create_backup(unnamed()).await.unwrap();
        settle().await;
        assert_eq!(lifecycle.creates.load(Ordering::SeqCst), 1);
        assert!(!store.get_backup("c1", created.name()).await.unwrap().is_terminal());

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(lifecycle.creates.load(Ordering::SeqCst), 2);
        assert!(store.get_backup("c1", created.name()).await.unwrap().is_terminal());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
