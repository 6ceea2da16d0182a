//! Object store and snapshot engine seams
//!
//! The reconciler never talks to a concrete storage backend. Clusters and
//! backups come from an [`ObjectStore`], snapshots are taken and removed by a
//! [`SnapshotEngine`]. Both are injected as trait objects.

mod memory;

pub use memory::MemoryObjectStore;

use crate::error::Result;
use crate::models::{Backup, Cluster};
use async_trait::async_trait;

/// Change notification for backup objects
#[derive(Debug, Clone, PartialEq)]
pub enum BackupEvent {
    /// Backup was created or updated
    Applied(Backup),
    /// Deletion was requested; the object stays readable until finalized
    Deleted(Backup),
}

impl BackupEvent {
    pub fn backup(&self) -> &Backup {
        match self {
            BackupEvent::Applied(b) | BackupEvent::Deleted(b) => b,
        }
    }
}

/// CRUD access to cluster and backup objects.
///
/// Updates are conditional on `metadata.resource_version`; a stale version
/// fails with [`crate::Error::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_cluster(&self, name: &str) -> Result<Cluster>;

    async fn list_clusters(&self) -> Result<Vec<Cluster>>;

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Backup>;

    /// All backups in `namespace`, manual ones included
    async fn list_backups(&self, namespace: &str) -> Result<Vec<Backup>>;

    /// Persist a new backup, generating its name from
    /// `metadata.generate_name` when `metadata.name` is empty
    async fn create_backup(&self, backup: Backup) -> Result<Backup>;

    async fn update_backup(&self, backup: Backup) -> Result<Backup>;

    /// Request deletion. The remove hook runs before the object is purged.
    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<()>;

    /// Purge a backup whose remove hook has finished
    async fn finalize_backup(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Takes and removes named snapshots of a cluster's coordination store.
///
/// One engine instance is shared by every concurrent reconciliation; calls
/// are stateless and keyed by cluster and snapshot name.
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    async fn save(&self, cluster: &Cluster, snapshot_name: &str) -> Result<()>;

    async fn remove_snapshot(&self, cluster: &Cluster, snapshot_name: &str) -> Result<()>;
}
