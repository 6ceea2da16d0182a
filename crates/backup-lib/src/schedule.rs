//! Eligibility, due-time and expiry decisions
//!
//! Pure functions over cluster and backup snapshots. The caller supplies
//! `now`, so every decision is reproducible in tests.

use crate::models::{Backup, Cluster};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Whether scheduled backups apply to `cluster`.
///
/// Requires a backup policy, `enabled: true` and a ready cluster.
pub fn is_eligible(cluster: &Cluster) -> bool {
    let Some(policy) = cluster.backup_policy() else {
        debug!(cluster = %cluster.name(), "No backup config for cluster, skipping");
        return false;
    };
    if !cluster.is_ready() {
        debug!(cluster = %cluster.name(), "Cluster is not ready, skipping");
        return false;
    }
    if !policy.is_enabled() {
        debug!(cluster = %cluster.name(), "Recurring backup is disabled for cluster");
        return false;
    }
    true
}

/// Completed transition time of a backup.
///
/// Missing or unparseable timestamps read as the earliest representable
/// time, so such a backup never blocks a new one from being due.
pub fn completed_time(backup: &Backup) -> DateTime<Utc> {
    backup
        .status
        .completed
        .transition_time()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Most recent non-manual backup by Completed transition time
pub fn newest_backup<'a>(backups: &'a [Backup]) -> Option<&'a Backup> {
    backups
        .iter()
        .filter(|b| !b.spec.manual)
        .max_by_key(|b| completed_time(b))
}

/// Whether a new scheduled backup should be created for `cluster`.
///
/// Only non-manual backups count. With none at all a backup is due
/// immediately.
pub fn is_due(cluster: &Cluster, backups: &[Backup], now: DateTime<Utc>) -> bool {
    let Some(newest) = newest_backup(backups) else {
        return true;
    };
    let Some(policy) = cluster.backup_policy() else {
        return false;
    };

    let Some(interval) = Duration::try_hours(i64::from(policy.interval_hours)) else {
        return false;
    };
    now.signed_duration_since(completed_time(newest)) > interval
}

/// Length of the retention window, or `None` when it is too large to
/// represent (such a window never expires anything).
pub fn retention_window(retention: u32, interval_hours: u32) -> Option<Duration> {
    i64::from(retention)
        .checked_mul(i64::from(interval_hours))
        .and_then(Duration::try_hours)
}

/// Non-manual backups older than `retention * interval_hours` hours.
///
/// Backups that were never named carry no Completed time and are never
/// expired. A named backup whose save is still pending is aged from the
/// time it was named.
pub fn expired_backups<'a>(
    backups: &'a [Backup],
    retention: u32,
    interval_hours: u32,
    now: DateTime<Utc>,
) -> Vec<&'a Backup> {
    let Some(keep) = retention_window(retention, interval_hours) else {
        debug!(retention, interval_hours, "Retention window out of range, nothing expires");
        return Vec::new();
    };

    backups
        .iter()
        .filter(|b| !b.spec.manual)
        .filter(|b| b.is_terminal() || b.status.completed.transition_time().is_some())
        .filter(|b| now.signed_duration_since(completed_time(b)) > keep)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BackupPolicy, ClusterSpec, ClusterStatus, Condition, ConditionStatus, ObjectMeta,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn cluster(policy: Option<BackupPolicy>, ready: bool) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: "c1".to_string(),
                ..Default::default()
            },
            spec: ClusterSpec {
                backup_policy: policy,
                ..Default::default()
            },
            status: ClusterStatus {
                ready: if ready {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
            },
        }
    }

    fn enabled(interval_hours: u32, retention: u32) -> BackupPolicy {
        BackupPolicy {
            enabled: Some(true),
            interval_hours,
            retention,
            ..Default::default()
        }
    }

    fn completed_hours_ago(name: &str, hours: i64, manual: bool) -> Backup {
        let mut backup = Backup::default();
        backup.metadata.name = name.to_string();
        backup.spec.manual = manual;
        backup.mark_created(format!("{}.zip", name), enabled(24, 3), now());
        backup.mark_succeeded(now() - Duration::hours(hours));
        backup
    }

    #[test]
    fn test_no_policy_not_eligible() {
        assert!(!is_eligible(&cluster(None, true)));
    }

    #[test]
    fn test_disabled_policy_not_eligible() {
        let mut policy = enabled(24, 3);
        policy.enabled = Some(false);
        assert!(!is_eligible(&cluster(Some(policy.clone()), true)));

        policy.enabled = None;
        assert!(!is_eligible(&cluster(Some(policy), true)));
    }

    #[test]
    fn test_not_ready_not_eligible() {
        assert!(!is_eligible(&cluster(Some(enabled(24, 3)), false)));
        assert!(is_eligible(&cluster(Some(enabled(24, 3)), true)));
    }

    #[test]
    fn test_due_with_no_backups() {
        let c = cluster(Some(enabled(24, 3)), true);
        assert!(is_due(&c, &[], now()));
    }

    #[test]
    fn test_manual_backups_do_not_count_for_due() {
        let c = cluster(Some(enabled(24, 3)), true);
        let backups = vec![completed_hours_ago("m1", 1, true)];
        assert!(is_due(&c, &backups, now()));
    }

    #[test]
    fn test_due_uses_newest_backup() {
        let c = cluster(Some(enabled(24, 3)), true);
        let backups = vec![
            completed_hours_ago("old", 30, false),
            completed_hours_ago("recent", 5, false),
        ];
        assert_eq!(newest_backup(&backups).unwrap().name(), "recent");
        assert!(!is_due(&c, &backups, now()));

        let backups = vec![completed_hours_ago("old", 30, false)];
        assert!(is_due(&c, &backups, now()));
    }

    #[test]
    fn test_due_boundary_is_exclusive() {
        let c = cluster(Some(enabled(24, 3)), true);
        let backups = vec![completed_hours_ago("b", 24, false)];
        assert!(!is_due(&c, &backups, now()));
    }

    // A backup whose Completed time is missing or malformed reads as the zero
    // time. This also hides a backup whose Completed condition was never
    // stamped; the test pins that behaviour so a change is deliberate.
    #[test]
    fn test_unparseable_completed_time_reads_as_oldest() {
        let c = cluster(Some(enabled(24, 3)), true);
        let mut backup = Backup::default();
        backup.status.completed = Condition {
            status: ConditionStatus::True,
            last_transition_time: Some("not-a-time".to_string()),
            ..Default::default()
        };
        assert_eq!(completed_time(&backup), DateTime::<Utc>::MIN_UTC);
        assert!(is_due(&c, &[backup], now()));
    }

    #[test]
    fn test_expired_backups_window() {
        let backups = vec![
            completed_hours_ago("expired", 100, false),
            completed_hours_ago("kept", 50, false),
        ];
        let expired = expired_backups(&backups, 3, 24, now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name(), "expired");
    }

    #[test]
    fn test_manual_backups_never_expire() {
        let backups = vec![completed_hours_ago("manual", 1000, true)];
        assert!(expired_backups(&backups, 3, 24, now()).is_empty());
    }

    #[test]
    fn test_in_flight_backup_not_expired() {
        // created but never named: no Completed time at all
        let mut backup = Backup::default();
        backup.metadata.name = "fresh".to_string();
        assert!(expired_backups(&[backup], 1, 1, now()).is_empty());
    }

    #[test]
    fn test_stuck_pending_save_ages_from_naming_time() {
        let mut backup = Backup::default();
        backup.metadata.name = "stuck".to_string();
        backup.mark_created("stuck.zip".to_string(), enabled(24, 3), now() - Duration::hours(100));
        assert_eq!(backup.phase(), crate::models::BackupPhase::PendingSave);

        assert_eq!(expired_backups(&[backup.clone()], 3, 24, now()).len(), 1);
        assert!(expired_backups(&[backup], 5, 24, now()).is_empty());
    }

    #[test]
    fn test_huge_retention_window_never_expires() {
        let backups = vec![completed_hours_ago("old", 100_000, false)];
        assert!(retention_window(2_000_000_000, 2_000).is_none());
        assert!(retention_window(u32::MAX, u32::MAX).is_none());
        assert!(expired_backups(&backups, 2_000_000_000, 2_000, now()).is_empty());
    }

    #[test]
    fn test_huge_interval_is_never_due() {
        let c = cluster(Some(enabled(u32::MAX, 3)), true);
        let backups = vec![completed_hours_ago("b", 100_000, false)];
        assert!(!is_due(&c, &backups, now()));
    }

    #[test]
    fn test_terminal_backup_with_malformed_time_expires() {
        let mut backup = completed_hours_ago("broken", 1, false);
        backup.status.completed.last_transition_time = Some("garbage".to_string());
        assert_eq!(expired_backups(&[backup], 3, 24, now()).len(), 1);
    }
}
