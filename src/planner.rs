//! Decides full vs incremental vs skip per subvolume via a four-rule
//! cascade: an overdue full backup beats a missing parent, which beats
//! an incremental that isn't due yet.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, ScheduleConfig};
use crate::snapshot::parse_snapshot_name;
use crate::state::State;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Full,
    Incremental,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub subvolume: String,
    pub action: Action,
    pub parent_snapshot: Option<String>,
    pub reason: String,
}

/// Plans one item per configured subvolume. `available_snapshots`, when
/// `Some`, restricts incremental parents to snapshots that still exist
/// on disk (a `None` last-snapshot check is skipped when the caller has
/// no such information, e.g. in isolated unit tests of the cascade).
pub fn plan_backups(
    config: &Config,
    state: &State,
    now: DateTime<Utc>,
    available_snapshots: Option<&HashSet<String>>,
) -> Vec<PlanItem> {
    config
        .subvolumes
        .paths
        .iter()
        .map(|path| {
            let name = subvolume_name(path);
            let sub_state = state.subvolumes.get(&name);
            plan_subvolume(&name, sub_state, &config.schedule, now, available_snapshots)
        })
        .collect()
}

fn plan_subvolume(
    name: &str,
    sub_state: Option<&crate::state::SubvolumeState>,
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
    available_snapshots: Option<&HashSet<String>>,
) -> PlanItem {
    let last_full_at = sub_state
        .and_then(|s| s.last_full_at.as_deref())
        .and_then(parse_iso_timestamp);
    let full_due = last_full_at
        .map(|at| now - at >= Duration::days(schedule.full_every_days as i64))
        .unwrap_or(true);
    if full_due {
        return PlanItem {
            subvolume: name.to_string(),
            action: Action::Full,
            parent_snapshot: None,
            reason: "full_due".to_string(),
        };
    }

    let last_snapshot = sub_state.and_then(|s| s.last_snapshot.clone());
    let Some(last_snapshot) = last_snapshot else {
        return PlanItem {
            subvolume: name.to_string(),
            action: Action::Full,
            parent_snapshot: None,
            reason: "missing_parent".to_string(),
        };
    };
    if let Some(available) = available_snapshots {
        if !available.contains(&last_snapshot) {
            return PlanItem {
                subvolume: name.to_string(),
                action: Action::Full,
                parent_snapshot: None,
                reason: "missing_parent".to_string(),
            };
        }
    }

    let last_snapshot_at = parse_snapshot_name(&last_snapshot).map(|(_, ts, _)| ts);
    let Some(last_snapshot_at) = last_snapshot_at else {
        return PlanItem {
            subvolume: name.to_string(),
            action: Action::Incremental,
            parent_snapshot: Some(last_snapshot),
            reason: "incremental_due".to_string(),
        };
    };
    if now - last_snapshot_at < Duration::days(schedule.incremental_every_days as i64) {
        return PlanItem {
            subvolume: name.to_string(),
            action: Action::Skip,
            parent_snapshot: Some(last_snapshot),
            reason: "incremental_not_due".to_string(),
        };
    }
    PlanItem {
        subvolume: name.to_string(),
        action: Action::Incremental,
        parent_snapshot: Some(last_snapshot),
        reason: "incremental_due".to_string(),
    }
}

fn subvolume_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn parse_iso_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
                .ok()
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::state::SubvolumeState;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            global: GlobalConfig {
                log_level: "info".to_string(),
                state_path: PathBuf::from("/tmp/state.json"),
                lock_path: PathBuf::from("/tmp/lock"),
                spool_dir: PathBuf::from("/tmp/spool"),
                spool_size_bytes: 1024,
            },
            schedule: ScheduleConfig {
                full_every_days: 180,
                incremental_every_days: 7,
                run_at: "02:00".to_string(),
            },
            snapshots: SnapshotsConfig {
                base_dir: PathBuf::from("/srv/snapshots"),
                retain: 2,
            },
            subvolumes: SubvolumesConfig {
                paths: vec![PathBuf::from("/srv/home")],
            },
            s3: S3Config {
                bucket: "b".to_string(),
                region: "us-east-1".to_string(),
                prefix: "p".to_string(),
                chunk_size_bytes: 1024,
                storage_class_chunks: "DEEP_ARCHIVE".to_string(),
                storage_class_manifest: "STANDARD".to_string(),
                concurrency: 4,
                sse: "AES256".to_string(),
                part_size_bytes: 5 * 1024 * 1024,
                multipart_threshold_bytes: 5 * 1024 * 1024,
                spool_enabled: false,
                retry: RetryConfig {
                    max_attempts: 5,
                    base_delay_ms: 1000,
                    max_delay_ms: 30_000,
                },
            },
            restore: RestoreConfig {
                target_base_dir: PathBuf::from("/srv/restore"),
                verify_mode: "full".to_string(),
                sample_max_files: 1000,
                wait_for_restore: true,
                restore_timeout_seconds: 3600,
                restore_tier: "Standard".to_string(),
            },
        }
    }

    #[test]
    fn no_prior_state_plans_full() {
        let config = base_config();
        let state = State::default();
        let now = Utc::now();
        let plans = plan_backups(&config, &state, now, None);
        assert_eq!(plans[0].action, Action::Full);
        assert_eq!(plans[0].reason, "full_due");
    }

    #[test]
    fn full_not_due_but_no_snapshot_plans_full_missing_parent() {
        let config = base_config();
        let mut state = State::default();
        state.subvolumes.insert(
            "home".to_string(),
            SubvolumeState {
                last_full_at: Some(Utc::now().to_rfc3339()),
                last_manifest: Some("m".to_string()),
                last_snapshot: None,
            },
        );
        let plans = plan_backups(&config, &state, Utc::now(), None);
        assert_eq!(plans[0].action, Action::Full);
        assert_eq!(plans[0].reason, "missing_parent");
    }

    #[test]
    fn recent_incremental_is_skipped() {
        let config = base_config();
        let now = Utc::now();
        let snapshot_name = crate::snapshot::snapshot_name("home", now, "inc");
        let mut state = State::default();
        state.subvolumes.insert(
            "home".to_string(),
            SubvolumeState {
                last_full_at: Some(now.to_rfc3339()),
                last_manifest: Some("m".to_string()),
                last_snapshot: Some(snapshot_name.clone()),
            },
        );
        let mut available = HashSet::new();
        available.insert(snapshot_name);
        let plans = plan_backups(&config, &state, now, Some(&available));
        assert_eq!(plans[0].action, Action::Skip);
        assert_eq!(plans[0].reason, "incremental_not_due");
    }

    #[test]
    fn stale_incremental_parent_falls_back_to_full() {
        let config = base_config();
        let now = Utc::now();
        let mut state = State::default();
        state.subvolumes.insert(
            "home".to_string(),
            SubvolumeState {
                last_full_at: Some(now.to_rfc3339()),
                last_manifest: Some("m".to_string()),
                last_snapshot: Some("home__20200101T000000Z__inc".to_string()),
            },
        );
        // available_snapshots does not contain the stale parent.
        let plans = plan_backups(&config, &state, now, Some(&HashSet::new()));
        assert_eq!(plans[0].action, Action::Full);
        assert_eq!(plans[0].reason, "missing_parent");
    }
}
