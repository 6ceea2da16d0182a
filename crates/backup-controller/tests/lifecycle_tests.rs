//! End-to-end flow: sweep creates a backup, the lifecycle controller saves
//! it, deletion removes the snapshot and purges the object

use async_trait::async_trait;
use backup_lib::{
    remote::{BlobStore, BlobStoreFactory, RemoteClientSettings},
    BackupPhase, BackupPolicy, BackupReconciler, Cluster, ClusterSpec, ClusterStatus,
    ConditionStatus, ControllerConfig, Error, LifecycleController, MemoryObjectStore, ObjectMeta,
    ObjectStore, Result, SnapshotEngine, SweepScheduler,
};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_test::assert_ok;

#[derive(Default)]
struct RecordingEngine {
    saved: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

#[async_trait]
impl SnapshotEngine for RecordingEngine {
    async fn save(&self, _cluster: &Cluster, snapshot_name: &str) -> Result<()> {
        self.saved.lock().unwrap().push(snapshot_name.to_string());
        Ok(())
    }

    async fn remove_snapshot(&self, _cluster: &Cluster, snapshot_name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(snapshot_name.to_string());
        Ok(())
    }
}

struct NoRemote;

impl BlobStoreFactory for NoRemote {
    fn connect(&self, _settings: &RemoteClientSettings) -> Result<Arc<dyn BlobStore>> {
        Err(Error::remote("no remote store in this test"))
    }
}

fn cluster() -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: "c1".to_string(),
            ..Default::default()
        },
        spec: ClusterSpec {
            backup_policy: Some(BackupPolicy {
                enabled: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        status: ClusterStatus {
            ready: ConditionStatus::True,
        },
    }
}

async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_backup_runs_to_completion_and_is_removed() {
    let store = Arc::new(MemoryObjectStore::with_clusters([cluster()]));
    let engine = Arc::new(RecordingEngine::default());
    let events = store.subscribe();

    let reconciler = BackupReconciler::new(store.clone(), engine.clone(), Arc::new(NoRemote));
    let controller = LifecycleController::new(
        store.clone(),
        Arc::new(reconciler),
        ControllerConfig::default(),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let controller_handle = tokio::spawn(controller.run(events, shutdown_rx));

    let stats = SweepScheduler::new(store.clone())
        .sweep_once(chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.created, 1);
    settle().await;

    let backups = store.list_backups("c1").await.unwrap();
    assert_eq!(backups.len(), 1);
    let backup = &backups[0];
    assert_eq!(backup.phase(), BackupPhase::Succeeded);
    assert!(backup.spec.filename.starts_with(backup.name()));
    assert_eq!(engine.saved.lock().unwrap().len(), 1);

    // an up-to-date cluster gets no second backup
    let stats = SweepScheduler::new(store.clone())
        .sweep_once(chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.created, 0);

    assert_ok!(store.delete_backup("c1", backup.name()).await);
    settle().await;

    assert_eq!(
        engine.removed.lock().unwrap().as_slice(),
        engine.saved.lock().unwrap().as_slice()
    );
    assert!(store.list_backups("c1").await.unwrap().is_empty());

    shutdown_tx.send(()).unwrap();
    controller_handle.await.unwrap();
}
