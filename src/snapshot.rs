//! Read-only snapshot creation, listing, and retention.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstraction over the external `btrfs` commands snapshot management
/// shells out to, so tests can substitute a fake runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<(), SnapshotError>;
}

#[derive(Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, args: &[String]) -> Result<(), SnapshotError> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| SnapshotError::Command("empty command".to_string()))?;
        let mut command = tokio::process::Command::new(program);
        command.args(rest);
        crate::pathenv::ensure_sbin_on_command_path(&mut command);
        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SnapshotError::Command(format!(
                "{} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub name: String,
    pub path: PathBuf,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

pub struct SnapshotManager<R: CommandRunner> {
    base_dir: PathBuf,
    runner: R,
}

impl<R: CommandRunner> SnapshotManager<R> {
    pub fn new(base_dir: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            base_dir: base_dir.into(),
            runner,
        }
    }

    pub async fn create_snapshot(
        &self,
        subvolume_path: &Path,
        subvolume_name: &str,
        kind: &str,
    ) -> Result<Snapshot, SnapshotError> {
        let created_at = Utc::now();
        let name = snapshot_name(subvolume_name, created_at, kind);
        let path = self.base_dir.join(&name);
        tokio::fs::create_dir_all(&self.base_dir).await?;
        self.runner
            .run(&[
                "btrfs".to_string(),
                "subvolume".to_string(),
                "snapshot".to_string(),
                "-r".to_string(),
                subvolume_path.display().to_string(),
                path.display().to_string(),
            ])
            .await?;
        Ok(Snapshot {
            name,
            path,
            kind: kind.to_string(),
            created_at,
        })
    }

    pub fn list_snapshots(&self, subvolume_name: &str) -> Result<Vec<Snapshot>, SnapshotError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy().to_string();
            let Some((subvol, created_at, kind)) = parse_snapshot_name(&name) else {
                continue;
            };
            if subvol != subvolume_name {
                continue;
            }
            snapshots.push(Snapshot {
                name: name.clone(),
                path: entry.path(),
                kind,
                created_at,
            });
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    pub async fn prune_snapshots(
        &self,
        subvolume_name: &str,
        retain: usize,
        keep_name: Option<&str>,
    ) -> Result<Vec<PathBuf>, SnapshotError> {
        let snapshots = self.list_snapshots(subvolume_name)?;
        let mut to_keep: std::collections::HashSet<String> = snapshots
            .iter()
            .take(retain)
            .map(|s| s.name.clone())
            .collect();
        if let Some(keep_name) = keep_name {
            to_keep.insert(keep_name.to_string());
        }
        let mut deleted = Vec::new();
        for snapshot in snapshots {
            if to_keep.contains(&snapshot.name) {
                continue;
            }
            self.runner
                .run(&[
                    "btrfs".to_string(),
                    "subvolume".to_string(),
                    "delete".to_string(),
                    snapshot.path.display().to_string(),
                ])
                .await?;
            deleted.push(snapshot.path);
        }
        Ok(deleted)
    }
}

pub fn snapshot_name(subvolume_name: &str, created_at: DateTime<Utc>, kind: &str) -> String {
    format!(
        "{}__{}__{}",
        subvolume_name,
        created_at.format("%Y%m%dT%H%M%SZ"),
        kind
    )
}

/// Parses `<subvol>__<YYYYMMDDTHHMMSSZ>__<full|inc>`, returning
/// `(subvolume, created_at, kind)`.
pub fn parse_snapshot_name(name: &str) -> Option<(String, DateTime<Utc>, String)> {
    let re = Regex::new(r"^(?P<subvol>.+)__(?P<ts>\d{8}T\d{6}Z)__(?P<kind>full|inc)$").unwrap();
    let caps = re.captures(name)?;
    let ts = chrono::NaiveDateTime::parse_from_str(&caps["ts"], "%Y%m%dT%H%M%SZ").ok()?;
    Some((
        caps["subvol"].to_string(),
        DateTime::from_naive_utc_and_offset(ts, Utc),
        caps["kind"].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, args: &[String]) -> Result<(), SnapshotError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(())
        }
    }

    #[test]
    fn snapshot_name_round_trips() {
        let ts = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = snapshot_name("home", ts, "full");
        assert_eq!(name, "home__20260101T000000Z__full");
        let (subvol, parsed_ts, kind) = parse_snapshot_name(&name).unwrap();
        assert_eq!(subvol, "home");
        assert_eq!(parsed_ts, ts);
        assert_eq!(kind, "full");
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert!(parse_snapshot_name("not-a-snapshot").is_none());
        assert!(parse_snapshot_name("home__20260101T000000Z__bogus").is_none());
    }

    #[tokio::test]
    async fn create_snapshot_invokes_runner_with_readonly_flag() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::default();
        let manager = SnapshotManager::new(dir.path().join("snaps"), runner);
        let snapshot = manager
            .create_snapshot(Path::new("/srv/home"), "home", "full")
            .await
            .unwrap();
        assert!(snapshot.name.starts_with("home__"));
        let calls = manager.runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&"-r".to_string()));
    }

    #[tokio::test]
    async fn prune_keeps_retained_and_pinned_parent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("snaps");
        std::fs::create_dir_all(&base).unwrap();
        for (ts, kind) in [
            ("20260101T000000Z", "full"),
            ("20260102T000000Z", "inc"),
            ("20260103T000000Z", "inc"),
        ] {
            std::fs::create_dir(base.join(format!("home__{ts}__{kind}"))).unwrap();
        }
        let runner = FakeRunner::default();
        let manager = SnapshotManager::new(&base, runner);
        let deleted = manager
            .prune_snapshots("home", 1, Some("home__20260101T000000Z__full"))
            .await
            .unwrap();
        // retain=1 keeps the newest (0103); pinned parent keeps 0101; 0102 is pruned.
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("home__20260102T000000Z__inc"));
    }
}
