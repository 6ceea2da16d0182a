//! Core data models for clusters and their backups

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Object metadata shared by clusters and backups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Backups live in the namespace named after their cluster; clusters are
    /// cluster-scoped and leave this empty.
    #[serde(default)]
    pub namespace: String,
    /// Prefix for a server-generated name, used when `name` is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    /// Version used for conditional updates
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Name of the owning cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Tri-state status of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[default]
    Unknown,
    True,
    False,
}

/// A named tri-state status flag with reason, message and transition time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC3339 text as persisted; may be absent or malformed on old objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// Move to `status`, stamping the transition time and clearing any
    /// previous reason/message.
    pub fn set(&mut self, status: ConditionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.reason = None;
        self.message = None;
        self.last_transition_time = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }

    /// Parsed transition time, `None` when missing or unparseable
    pub fn transition_time(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Off-cluster target for backup archives
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTarget {
    /// Object storage endpoint host, e.g. "s3.us-east-1.amazonaws.com"
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// PEM encoded CA bundle trusted for this target only
    #[serde(default, rename = "customCA")]
    pub custom_ca: String,
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("folder", &self.folder)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("custom_ca", &!self.custom_ca.is_empty())
            .finish()
    }
}

/// Per-cluster backup policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    /// Unset and `false` both disable scheduled backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,
    /// Number of intervals a scheduled backup is kept for
    #[serde(default = "default_retention")]
    pub retention: u32,
    /// Replace ':' in generated filenames with '-'
    #[serde(default)]
    pub safe_timestamp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteTarget>,
}

fn default_interval_hours() -> u32 {
    12
}

fn default_retention() -> u32 {
    6
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            enabled: None,
            interval_hours: default_interval_hours(),
            retention: default_retention(),
            safe_timestamp: false,
            remote: None,
        }
    }
}

impl BackupPolicy {
    pub fn is_enabled(&self) -> bool {
        self.enabled == Some(true)
    }
}

/// Desired state of a managed cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_policy: Option<BackupPolicy>,
    /// Opaque configuration forwarded to the snapshot engine
    #[serde(default)]
    pub engine_config: serde_json::Value,
}

/// Observed state of a managed cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub ready: ConditionStatus,
}

/// A managed cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn backup_policy(&self) -> Option<&BackupPolicy> {
        self.spec.backup_policy.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.status.ready == ConditionStatus::True
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Desired state of a backup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub cluster_id: String,
    #[serde(default)]
    pub manual: bool,
    /// Local filename or remote URL, resolved once when the backup is named
    #[serde(default)]
    pub filename: String,
    /// Policy frozen at naming time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_config: Option<BackupPolicy>,
}

/// Lifecycle phase of a backup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupPhase {
    /// Waiting for filename and policy to be committed
    #[default]
    PendingNaming,
    /// Named; snapshot save not yet confirmed
    PendingSave,
    Succeeded,
    Failed,
}

impl BackupPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupPhase::Succeeded | BackupPhase::Failed)
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingNaming => write!(f, "PendingNaming"),
            Self::PendingSave => write!(f, "PendingSave"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed state of a backup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,
    #[serde(default)]
    pub created: Condition,
    #[serde(default)]
    pub completed: Condition,
}

/// One snapshot attempt and its result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub metadata: ObjectMeta,
    pub spec: BackupSpec,
    #[serde(default)]
    pub status: BackupStatus,
}

impl Backup {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name`, unique across the object store
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn phase(&self) -> BackupPhase {
        self.status.phase
    }

    pub fn is_created(&self) -> bool {
        self.status.created.is_true()
    }

    /// Completed is True or False; no further save attempts happen
    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
            || self.status.completed.is_true()
            || self.status.completed.is_false()
    }

    /// Commit the filename and frozen policy. Has no effect once Created is
    /// already True.
    pub fn mark_created(&mut self, filename: String, policy: BackupPolicy, now: DateTime<Utc>) {
        if self.is_created() {
            return;
        }
        self.spec.filename = filename;
        self.spec.backup_config = Some(policy);
        self.status.created.set(ConditionStatus::True, now);
        // explicit Unknown so the backup never reads as done before the save
        self.status.completed.set(ConditionStatus::Unknown, now);
        self.status.phase = BackupPhase::PendingSave;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status.completed.set(ConditionStatus::True, now);
        self.status.phase = BackupPhase::Succeeded;
    }

    pub fn mark_failed(&mut self, reason: &str, message: String, now: DateTime<Utc>) {
        self.status.completed.set(ConditionStatus::False, now);
        self.status.completed.reason = Some(reason.to_string());
        self.status.completed.message = Some(message);
        self.status.phase = BackupPhase::Failed;
    }

    /// The remote target frozen onto this backup, if any
    pub fn remote_target(&self) -> Option<&RemoteTarget> {
        self.spec
            .backup_config
            .as_ref()
            .and_then(|p| p.remote.as_ref())
    }
}
