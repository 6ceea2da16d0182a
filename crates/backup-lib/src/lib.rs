//! Backup lifecycle library for managed etcd clusters
//!
//! This crate provides the core functionality for:
//! - Scheduled backup creation and retention-based rotation
//! - The per-backup naming, save and removal state machine
//! - Remote archive cleanup on S3-compatible blob stores
//! - Health checks and observability

pub mod backoff;
pub mod controller;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod naming;
pub mod observability;
pub mod remote;
pub mod schedule;
pub mod store;
pub mod sweep;

pub use controller::{ControllerConfig, LifecycleController};
pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::{BackupLifecycle, BackupReconciler, ReconcilerConfig};
pub use models::*;
pub use observability::{BackupMetrics, StructuredLogger};
pub use store::{BackupEvent, MemoryObjectStore, ObjectStore, SnapshotEngine};
pub use sweep::SweepScheduler;
