//! In-memory object store
//!
//! Keeps clusters and backups in concurrent maps, enforces resource-version
//! conflicts on update and fans change events out to subscribers.

use super::{BackupEvent, ObjectStore};
use crate::error::{Error, Result};
use crate::models::{Backup, Cluster};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Object store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    clusters: DashMap<String, Cluster>,
    /// Keyed by `namespace/name`
    backups: DashMap<String, Backup>,
    version: AtomicU64,
    name_counter: AtomicU64,
    watchers: Mutex<Vec<mpsc::UnboundedSender<BackupEvent>>>,
}

fn backup_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `clusters`
    pub fn with_clusters(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let store = Self::new();
        for cluster in clusters {
            store.upsert_cluster(cluster);
        }
        store
    }

    /// Insert or replace a cluster
    pub fn upsert_cluster(&self, mut cluster: Cluster) {
        cluster.metadata.resource_version = self.next_version();
        self.clusters.insert(cluster.metadata.name.clone(), cluster);
    }

    pub fn remove_cluster(&self, name: &str) -> Option<Cluster> {
        self.clusters.remove(name).map(|(_, c)| c)
    }

    /// Receive every backup change from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BackupEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_watchers().push(tx);
        rx
    }

    /// Snapshot of every stored backup, sorted by key
    pub fn all_backups(&self) -> Vec<Backup> {
        let mut backups: Vec<Backup> = self.backups.iter().map(|e| e.value().clone()).collect();
        backups.sort_by_key(|b| b.key());
        backups
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<BackupEvent>>> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver an event, dropping subscribers that went away.
    /// Returns whether anyone is still listening.
    fn emit(&self, event: BackupEvent) -> bool {
        let mut watchers = self.lock_watchers();
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
        !watchers.is_empty()
    }

    fn generate_name(&self, prefix: &str) -> String {
        loop {
            let n = self.name_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let candidate = format!("{}{:05x}", prefix, n);
            if !self.backups.iter().any(|e| e.value().metadata.name == candidate) {
                return candidate;
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        self.clusters
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::ClusterNotFound {
                cluster: name.to_string(),
            })
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut clusters: Vec<Cluster> = self.clusters.iter().map(|e| e.value().clone()).collect();
        clusters.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(clusters)
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Backup> {
        self.backups
            .get(&backup_key(namespace, name))
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::BackupNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_backups(&self, namespace: &str) -> Result<Vec<Backup>> {
        let mut backups: Vec<Backup> = self
            .backups
            .iter()
            .filter(|e| e.value().metadata.namespace == namespace)
            .map(|e| e.value().clone())
            .collect();
        backups.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(backups)
    }

    async fn create_backup(&self, mut backup: Backup) -> Result<Backup> {
        if backup.metadata.name.is_empty() {
            let prefix = backup
                .metadata
                .generate_name
                .clone()
                .unwrap_or_else(|| format!("{}-", backup.spec.cluster_id));
            backup.metadata.name = self.generate_name(&prefix);
        }

        let key = backup.key();
        backup.metadata.resource_version = self.next_version();
        backup.metadata.creation_timestamp = Some(Utc::now());
        backup.metadata.deletion_timestamp = None;

        match self.backups.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Conflict {
                    kind: "backup",
                    name: backup.metadata.name,
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(backup.clone());
            }
        }

        debug!(backup = %backup.key(), "Backup object created");
        self.emit(BackupEvent::Applied(backup.clone()));
        Ok(backup)
    }

    async fn update_backup(&self, mut backup: Backup) -> Result<Backup> {
        let key = backup.key();
        {
            let mut stored = self.backups.get_mut(&key).ok_or_else(|| Error::BackupNotFound {
                namespace: backup.metadata.namespace.clone(),
                name: backup.metadata.name.clone(),
            })?;

            if stored.metadata.resource_version != backup.metadata.resource_version {
                return Err(Error::Conflict {
                    kind: "backup",
                    name: backup.metadata.name,
                });
            }

            // server-owned fields
            backup.metadata.creation_timestamp = stored.metadata.creation_timestamp;
            backup.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
            backup.metadata.resource_version = self.next_version();
            *stored = backup.clone();
        }

        self.emit(BackupEvent::Applied(backup.clone()));
        Ok(backup)
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<()> {
        let key = backup_key(namespace, name);
        let marked = {
            let mut stored = self.backups.get_mut(&key).ok_or_else(|| Error::BackupNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
            if stored.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            stored.metadata.deletion_timestamp = Some(Utc::now());
            stored.metadata.resource_version = self.next_version();
            stored.clone()
        };

        // nobody to run the remove hook: purge right away
        if !self.emit(BackupEvent::Deleted(marked)) {
            self.backups.remove(&key);
        }
        Ok(())
    }

    async fn finalize_backup(&self, namespace: &str, name: &str) -> Result<()> {
        if self.backups.remove(&backup_key(namespace, name)).is_some() {
            debug!(backup = %backup_key(namespace, name), "Backup object purged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupSpec, ObjectMeta};

    fn unnamed(cluster: &str) -> Backup {
        Backup {
            metadata: ObjectMeta {
                namespace: cluster.to_string(),
                generate_name: Some(format!("{}-rl-", cluster)),
                ..Default::default()
            },
            spec: BackupSpec {
                cluster_id: cluster.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_generates_name() {
        let store = MemoryObjectStore::new();
        let a = store.create_backup(unnamed("c1")).await.unwrap();
        let b = store.create_backup(unnamed("c1")).await.unwrap();

        assert!(a.name().starts_with("c1-rl-"));
        assert_ne!(a.name(), b.name());
        assert!(a.metadata.creation_timestamp.is_some());
        assert_eq!(store.list_backups("c1").await.unwrap().len(), 2);
        assert!(store.list_backups("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryObjectStore::new();
        let created = store.create_backup(unnamed("c1")).await.unwrap();

        let mut first = created.clone();
        first.spec.filename = "one.zip".to_string();
        store.update_backup(first).await.unwrap();

        let mut stale = created;
        stale.spec.filename = "two.zip".to_string();
        let err = store.update_backup(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_without_watchers_purges() {
        let store = MemoryObjectStore::new();
        let created = store.create_backup(unnamed("c1")).await.unwrap();

        store.delete_backup("c1", created.name()).await.unwrap();
        assert!(store.get_backup("c1", created.name()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_with_watcher_waits_for_finalize() {
        let store = MemoryObjectStore::new();
        let mut events = store.subscribe();
        let created = store.create_backup(unnamed("c1")).await.unwrap();
        assert!(matches!(events.recv().await, Some(BackupEvent::Applied(_))));

        store.delete_backup("c1", created.name()).await.unwrap();
        match events.recv().await {
            Some(BackupEvent::Deleted(b)) => assert!(b.metadata.deletion_timestamp.is_some()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(store.get_backup("c1", created.name()).await.is_ok());

        // a second delete is a no-op while the first is pending
        store.delete_backup("c1", created.name()).await.unwrap();
        assert!(events.try_recv().is_err());

        store.finalize_backup("c1", created.name()).await.unwrap();
        assert!(store.get_backup("c1", created.name()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_cluster() {
        let store = MemoryObjectStore::new();
        let err = store.get_cluster("nope").await.unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound { .. }));
    }
}
