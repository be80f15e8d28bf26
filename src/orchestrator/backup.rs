//! Drives one backup run end to end: lock, plan, snapshot, stream,
//! chunk, upload, publish, persist state, prune.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{error, info};

use crate::config::Config;
use crate::lock::{LockError, LockFile};
use crate::manifest::{publish_manifest, ChunkEntry, CurrentPointer, Manifest, SnapshotInfo};
use crate::metrics::{calculate_metrics, format_throughput};
use crate::object_store::ObjectStore;
use crate::planner::{plan_backups, Action, PlanItem};
use crate::send_process::SendProcess;
use crate::snapshot::{CommandRunner, Snapshot, SnapshotManager};
use crate::state::{load_state, save_state, State, SubvolumeState};
use crate::uploader::{RetryPolicy, SpoolConfig, UploadConfig, Uploader};

/// Environment variable naming a scratch directory in which the backup
/// run mirrors the first selected subvolume's chunk list as local JSON,
/// for integration-test introspection.
pub const HARNESS_RUN_DIR_ENV: &str = "SNAPVAULT_HARNESS_RUN_DIR";

/// How long to wait after SIGTERM before escalating to SIGKILL when a
/// `btrfs send` child must be stopped mid-stream.
const SEND_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub dry_run: bool,
    pub subvolume_names: Option<Vec<String>>,
    pub once: bool,
    pub no_s3: bool,
}

pub struct BackupOrchestrator<S: ObjectStore, R: CommandRunner + Clone> {
    config: Config,
    store: Arc<S>,
    runner: R,
}

impl<S: ObjectStore + 'static, R: CommandRunner + Clone + 'static> BackupOrchestrator<S, R> {
    pub fn new(config: Config, store: Arc<S>, runner: R) -> Self {
        Self {
            config,
            store,
            runner,
        }
    }

    /// Runs one backup pass, returning a process exit code (0 success,
    /// 1 operational failure, 2 usage/config failure).
    pub async fn run(&self, request: &BackupRequest) -> i32 {
        if request.dry_run {
            info!(event = "backup_dry_run", status = "skipped");
            return 0;
        }

        let mut lock = LockFile::new(&self.config.global.lock_path);
        if let Err(err) = lock.acquire() {
            match err {
                LockError::HeldByLivePid(pid) => {
                    error!(event = "backup_lock_failed", error = %LockError::HeldByLivePid(pid));
                }
                other => error!(event = "backup_lock_failed", error = %other),
            }
            return 1;
        }
        let result = self.run_locked(request).await;
        lock.release();
        result
    }

    async fn run_locked(&self, request: &BackupRequest) -> i32 {
        let now = Utc::now();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let prefix = build_prefix(&self.config.s3.prefix);
        let run_dir = std::env::var(HARNESS_RUN_DIR_ENV).ok();
        let write_manifest = run_dir.is_some();

        let mut state = match load_state(&self.config.global.state_path) {
            Ok(state) => state,
            Err(err) => {
                error!(event = "backup_state_load_failed", error = %err);
                return 1;
            }
        };

        let selected = self.select_subvolumes(write_manifest, request.subvolume_names.as_deref());
        if selected.is_empty() {
            error!(event = "backup_no_subvolumes", status = "failed");
            return 2;
        }

        let snapshot_manager = SnapshotManager::new(
            self.config.snapshots.base_dir.clone(),
            self.runner.clone(),
        );

        let work_items = match self.plan_work(&state, now, &snapshot_manager, &selected, request.once) {
            Ok(items) => items,
            Err(()) => return 1,
        };
        if work_items.is_empty() {
            info!(event = "backup_not_due", status = "skipped");
            return 0;
        }

        if request.no_s3 {
            info!(event = "backup_no_s3", status = "skipped");
            return 0;
        }
        if !self.store.has_credentials().await {
            info!(event = "backup_no_credentials", status = "skipped");
            return 0;
        }

        let uploader = Uploader::new(self.store.clone(), self.upload_config());
        let uploader = match uploader {
            Ok(uploader) => uploader,
            Err(err) => {
                error!(event = "backup_uploader_init_failed", error = %err);
                return 1;
            }
        };

        for (subvolume_path, plan_item, action) in &work_items {
            let code = self
                .backup_item(
                    subvolume_path,
                    plan_item,
                    action,
                    &mut state,
                    &timestamp,
                    &prefix,
                    &snapshot_manager,
                    &uploader,
                    write_manifest,
                    run_dir.as_deref(),
                    &selected,
                )
                .await;
            if code != 0 {
                return code;
            }
        }

        state.last_run_at = Some(timestamp);
        if let Err(err) = save_state(&self.config.global.state_path, &state) {
            error!(event = "backup_state_save_failed", error = %err);
            return 1;
        }
        0
    }

    fn select_subvolumes(&self, write_manifest: bool, names: Option<&[String]>) -> Vec<PathBuf> {
        let paths = &self.config.subvolumes.paths;
        if let Some(names) = names {
            if !names.is_empty() {
                let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
                return paths
                    .iter()
                    .filter(|p| {
                        p.file_name()
                            .map(|n| wanted.contains(n.to_string_lossy().as_ref()))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
            }
        }
        if write_manifest {
            return paths.iter().take(1).cloned().collect();
        }
        paths.clone()
    }

    fn plan_work(
        &self,
        state: &State,
        now: chrono::DateTime<Utc>,
        snapshot_manager: &SnapshotManager<R>,
        selected: &[PathBuf],
        force_run: bool,
    ) -> Result<Vec<(PathBuf, PlanItem, Action)>, ()> {
        let mut available_snapshots = HashSet::new();
        for path in selected {
            let name = subvolume_name(path);
            match snapshot_manager.list_snapshots(&name) {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        available_snapshots.insert(snapshot.name);
                    }
                }
                Err(err) => {
                    error!(event = "backup_list_snapshots_failed", subvolume = %name, error = %err);
                    return Err(());
                }
            }
        }

        let plan_config = if selected.len() == self.config.subvolumes.paths.len() {
            self.config.clone()
        } else {
            let mut cfg = self.config.clone();
            cfg.subvolumes.paths = selected.to_vec();
            cfg
        };
        let plan = plan_backups(&plan_config, state, now, Some(&available_snapshots));
        let plan_by_name: std::collections::HashMap<String, PlanItem> = plan
            .into_iter()
            .map(|item| (item.subvolume.clone(), item))
            .collect();

        let mut work_items = Vec::new();
        for path in selected {
            let name = subvolume_name(path);
            let Some(item) = plan_by_name.get(&name) else {
                continue;
            };
            let mut action = item.action.clone();
            if action == Action::Skip && force_run {
                action = if item.parent_snapshot.is_some() {
                    Action::Incremental
                } else {
                    Action::Full
                };
            }
            if action == Action::Skip {
                info!(event = "backup_not_due", subvolume = %item.subvolume, reason = %item.reason);
                continue;
            }
            work_items.push((path.clone(), item.clone(), action));
        }
        Ok(work_items)
    }

    fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            storage_class: self.config.s3.storage_class_chunks.clone(),
            sse: Some(self.config.s3.sse.clone()),
            part_size_bytes: self.config.s3.part_size_bytes as usize,
            multipart_threshold_bytes: self.config.s3.multipart_threshold_bytes as usize,
            concurrency: self.config.s3.concurrency,
            retry: RetryPolicy {
                max_attempts: self.config.s3.retry.max_attempts,
                base_delay: std::time::Duration::from_millis(self.config.s3.retry.base_delay_ms),
                max_delay: std::time::Duration::from_millis(self.config.s3.retry.max_delay_ms),
            },
            spool: if self.config.s3.spool_enabled {
                Some(SpoolConfig {
                    dir: self.config.global.spool_dir.clone(),
                    size_bytes: self.config.global.spool_size_bytes,
                })
            } else {
                None
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn backup_item(
        &self,
        subvolume_path: &Path,
        plan_item: &PlanItem,
        action: &Action,
        state: &mut State,
        timestamp: &str,
        prefix: &str,
        snapshot_manager: &SnapshotManager<R>,
        uploader: &Uploader<S>,
        write_manifest: bool,
        run_dir: Option<&str>,
        selected: &[PathBuf],
    ) -> i32 {
        let subvol_name = subvolume_name(subvolume_path);
        let subvol_state = state.subvolumes.get(&subvol_name).cloned().unwrap_or_default();

        let (effective_action, parent_snapshot, parent_manifest) =
            self.resolve_parents(action, plan_item, &subvol_name, &subvol_state);
        let effective_kind = if effective_action == Action::Full { "full" } else { "incremental" };
        let snapshot_kind = if effective_action == Action::Full { "full" } else { "inc" };

        let snapshot = match snapshot_manager
            .create_snapshot(subvolume_path, &subvol_name, snapshot_kind)
            .await
        {
            Ok(snapshot) => {
                info!(
                    event = "snapshot_created",
                    subvolume = %subvol_name,
                    path = %snapshot.path.display(),
                    kind = snapshot_kind,
                );
                snapshot
            }
            Err(err) => {
                error!(event = "backup_snapshot_failed", subvolume = %subvol_name, error = %err);
                return 1;
            }
        };

        let send_parent = if effective_kind == "incremental" {
            parent_snapshot.as_ref()
        } else {
            None
        };
        let start = Instant::now();
        let stream_result = self
            .upload_stream(
                &snapshot,
                send_parent,
                &subvol_name,
                effective_kind,
                timestamp,
                prefix,
                uploader,
            )
            .await;
        let (total_bytes, chunks, local_chunks) = match stream_result {
            Some(result) => result,
            None => return 1,
        };

        let manifest_key = match self
            .publish_manifest_for(
                &subvol_name,
                effective_kind,
                timestamp,
                prefix,
                &snapshot,
                parent_manifest.as_deref(),
                &chunks,
                total_bytes,
            )
            .await
        {
            Ok(key) => key,
            Err(err) => {
                error!(event = "backup_manifest_publish_failed", subvolume = %subvol_name, error = %err);
                return 1;
            }
        };

        let elapsed = start.elapsed().as_secs_f64();
        let metrics = calculate_metrics(total_bytes, elapsed);
        info!(
            event = "backup_metrics",
            subvolume = %subvol_name,
            total_bytes = metrics.total_bytes,
            elapsed_seconds = metrics.elapsed_seconds,
            throughput = %format_throughput(metrics.throughput_bytes_per_sec()),
        );
        info!(
            event = "backup_uploaded",
            subvolume = %subvol_name,
            manifest_key = %manifest_key,
            chunk_count = chunks.len(),
        );

        if write_manifest {
            if let (Some(run_dir), Some(first)) = (run_dir, selected.first()) {
                if first == subvolume_path {
                    self.write_harness_manifest(run_dir, effective_kind, &local_chunks);
                }
            }
        }

        let previous_full_at = subvol_state.last_full_at.clone();
        state.subvolumes.insert(
            subvol_name.clone(),
            SubvolumeState {
                last_snapshot: Some(snapshot.name.clone()),
                last_manifest: Some(manifest_key),
                last_full_at: if effective_kind == "full" {
                    Some(timestamp.to_string())
                } else {
                    previous_full_at
                },
            },
        );

        if let Err(err) = snapshot_manager
            .prune_snapshots(
                &subvol_name,
                self.config.snapshots.retain,
                parent_snapshot.as_deref(),
            )
            .await
        {
            error!(event = "backup_prune_failed", subvolume = %subvol_name, error = %err);
            return 1;
        }
        0
    }

    fn resolve_parents(
        &self,
        action: &Action,
        plan_item: &PlanItem,
        subvol_name: &str,
        subvol_state: &SubvolumeState,
    ) -> (Action, Option<String>, Option<String>) {
        let mut action = action.clone();
        let mut parent_snapshot = None;
        if action == Action::Incremental {
            if let Some(name) = &plan_item.parent_snapshot {
                let path = self.config.snapshots.base_dir.join(name);
                if path.exists() {
                    parent_snapshot = Some(name.clone());
                } else {
                    info!(event = "backup_parent_missing", subvolume = %subvol_name, path = %path.display());
                    action = Action::Full;
                }
            } else {
                action = Action::Full;
            }
        }
        if action == Action::Incremental && subvol_state.last_manifest.is_none() {
            info!(event = "backup_parent_manifest_missing", subvolume = %subvol_name);
            action = Action::Full;
            parent_snapshot = None;
        }
        let parent_manifest = if action == Action::Incremental {
            subvol_state.last_manifest.clone()
        } else {
            None
        };
        (action, parent_snapshot, parent_manifest)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_stream(
        &self,
        snapshot: &Snapshot,
        send_parent: Option<&String>,
        subvol_name: &str,
        effective_kind: &str,
        timestamp: &str,
        prefix: &str,
        uploader: &Uploader<S>,
    ) -> Option<(u64, Vec<ChunkEntry>, Vec<serde_json::Value>)> {
        let parent_path = send_parent.map(|name| self.config.snapshots.base_dir.join(name));
        let process = match SendProcess::spawn(&snapshot.path, parent_path.as_deref()).await {
            Ok(process) => process,
            Err(err) => {
                error!(event = "btrfs_send_spawn_failed", subvolume = %subvol_name, error = %err);
                return None;
            }
        };

        let mut chunker = match crate::chunker::Chunker::new(process, self.config.s3.chunk_size_bytes as usize) {
            Ok(chunker) => chunker,
            Err(err) => {
                error!(event = "backup_chunker_init_failed", subvolume = %subvol_name, error = %err);
                return None;
            }
        };

        let mut chunks = Vec::new();
        let mut local_chunks = Vec::new();
        let mut total_bytes = 0u64;
        loop {
            let next = chunker.next_chunk().await;
            let mut reader = match next {
                Ok(Some(reader)) => reader,
                Ok(None) => break,
                Err(err) => {
                    let stderr = chunker.into_inner().kill_and_collect_stderr(SEND_KILL_GRACE).await;
                    error!(event = "backup_stream_failed", subvolume = %subvol_name, error = %err, stderr);
                    return None;
                }
            };
            let index = reader.index();
            let chunk_key = format!(
                "{prefix}subvol/{subvol_name}/{effective_kind}/chunk-{timestamp}-{index}.bin"
            );
            let upload_result = match uploader.upload_reader(&chunk_key, &mut reader).await {
                Ok(result) => result,
                Err(err) => {
                    drop(reader);
                    let stderr = chunker.into_inner().kill_and_collect_stderr(SEND_KILL_GRACE).await;
                    error!(event = "backup_upload_failed", subvolume = %subvol_name, key = %chunk_key, error = %err, stderr);
                    return None;
                }
            };
            let (size, sha256) = match (reader.size(), reader.sha256()) {
                (Ok(size), Ok(sha256)) => (size, sha256),
                _ => {
                    drop(reader);
                    let stderr = chunker.into_inner().kill_and_collect_stderr(SEND_KILL_GRACE).await;
                    error!(event = "backup_chunk_not_drained", subvolume = %subvol_name, index, stderr);
                    return None;
                }
            };
            total_bytes += size as u64;
            chunks.push(ChunkEntry {
                key: chunk_key.clone(),
                size: size as u64,
                sha256: sha256.clone(),
                etag: upload_result_etag(&upload_result),
            });
            local_chunks.push(json!({"index": index, "key": chunk_key, "sha256": sha256}));
        }

        let process = chunker.into_inner();
        if let Err(err) = process.finish().await {
            error!(event = "backup_stream_failed", subvolume = %subvol_name, error = %err);
            return None;
        }

        Some((total_bytes, chunks, local_chunks))
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_manifest_for(
        &self,
        subvol_name: &str,
        effective_kind: &str,
        timestamp: &str,
        prefix: &str,
        snapshot: &Snapshot,
        parent_manifest: Option<&str>,
        chunks: &[ChunkEntry],
        total_bytes: u64,
    ) -> Result<String, crate::manifest::ManifestError> {
        let manifest_key =
            format!("{prefix}subvol/{subvol_name}/{effective_kind}/manifest-{timestamp}.json");
        let current_key = format!("{prefix}subvol/{subvol_name}/current.json");
        let manifest = Manifest {
            chunk_size: self.config.s3.chunk_size_bytes,
            chunks: chunks.to_vec(),
            created_at: timestamp.to_string(),
            kind: effective_kind.to_string(),
            parent_manifest: parent_manifest.map(str::to_string),
            s3: json!({"storage_class": self.config.s3.storage_class_chunks}),
            snapshot: SnapshotInfo {
                name: snapshot.name.clone(),
                parent_uuid: None,
                path: snapshot.path.display().to_string(),
                uuid: None,
            },
            subvolume: subvol_name.to_string(),
            total_bytes,
            version: 1,
        };
        let pointer = CurrentPointer {
            created_at: timestamp.to_string(),
            kind: effective_kind.to_string(),
            manifest_key: manifest_key.clone(),
        };
        publish_manifest(
            self.store.as_ref(),
            &manifest_key,
            &current_key,
            &manifest,
            &pointer,
            &self.config.s3.storage_class_manifest,
            Some(&self.config.s3.sse),
        )
        .await?;
        Ok(manifest_key)
    }

    fn write_harness_manifest(
        &self,
        run_dir: &str,
        effective_kind: &str,
        local_chunks: &[serde_json::Value],
    ) {
        let run_dir = Path::new(run_dir);
        if let Err(err) = std::fs::create_dir_all(run_dir) {
            error!(event = "manifest_write_failed", error = %err);
            return;
        }
        let manifest_path = run_dir.join("manifest.json");
        let payload = json!({"backup_type": effective_kind, "chunks": local_chunks});
        let body = match serde_json::to_vec_pretty(&payload) {
            Ok(body) => body,
            Err(err) => {
                error!(event = "manifest_write_failed", error = %err);
                return;
            }
        };
        if let Err(err) = std::fs::write(&manifest_path, body) {
            error!(event = "manifest_write_failed", error = %err);
            return;
        }
        info!(event = "manifest_written", path = %manifest_path.display());
    }
}

fn upload_result_etag(_result: &crate::uploader::UploadResult) -> Option<String> {
    // The uploader doesn't surface a single object-level ETag for
    // multipart uploads (S3 computes one from the part ETags on
    // completion); the manifest records per-chunk sha256 as the
    // integrity source of truth instead.
    None
}

pub fn build_prefix(prefix: &str) -> String {
    let normalized = prefix.trim_end_matches('/');
    if normalized.is_empty() {
        String::new()
    } else {
        format!("{normalized}/")
    }
}

fn subvolume_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use crate::object_store::InMemoryObjectStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct FakeRunner {
        calls: Arc<StdMutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, args: &[String]) -> Result<(), crate::snapshot::SnapshotError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(())
        }
    }

    fn test_config(base_dir: &Path, subvol: &Path) -> Config {
        Config {
            global: GlobalConfig {
                log_level: "info".to_string(),
                state_path: base_dir.join("state.json"),
                lock_path: base_dir.join("lock"),
                spool_dir: base_dir.join("spool"),
                spool_size_bytes: 1024 * 1024 * 1024,
            },
            schedule: ScheduleConfig {
                full_every_days: 180,
                incremental_every_days: 7,
                run_at: "02:00".to_string(),
            },
            snapshots: SnapshotsConfig {
                base_dir: base_dir.join("snapshots"),
                retain: 2,
            },
            subvolumes: SubvolumesConfig {
                paths: vec![subvol.to_path_buf()],
            },
            s3: S3Config {
                bucket: "bucket".to_string(),
                region: "us-east-1".to_string(),
                prefix: "backups".to_string(),
                chunk_size_bytes: 1024,
                storage_class_chunks: "STANDARD".to_string(),
                storage_class_manifest: "STANDARD".to_string(),
                concurrency: 2,
                sse: "AES256".to_string(),
                part_size_bytes: 5 * 1024 * 1024,
                multipart_threshold_bytes: 5 * 1024 * 1024,
                spool_enabled: false,
                retry: RetryConfig {
                    max_attempts: 3,
                    base_delay_ms: 1,
                    max_delay_ms: 5,
                },
            },
            restore: RestoreConfig {
                target_base_dir: base_dir.join("restore"),
                verify_mode: "full".to_string(),
                sample_max_files: 1000,
                wait_for_restore: true,
                restore_timeout_seconds: 3600,
                restore_tier: "Standard".to_string(),
            },
        }
    }

    #[test]
    fn build_prefix_normalizes_trailing_slash() {
        assert_eq!(build_prefix("backups"), "backups/");
        assert_eq!(build_prefix("backups/"), "backups/");
        assert_eq!(build_prefix(""), "");
    }

    #[tokio::test]
    async fn dry_run_returns_zero_without_touching_state() {
        let dir = tempfile::tempdir().unwrap();
        let subvol = dir.path().join("home");
        std::fs::create_dir_all(&subvol).unwrap();
        let config = test_config(dir.path(), &subvol);
        let store = Arc::new(InMemoryObjectStore::new());
        let orchestrator = BackupOrchestrator::new(config.clone(), store, FakeRunner::default());
        let code = orchestrator
            .run(&BackupRequest {
                dry_run: true,
                ..Default::default()
            })
            .await;
        assert_eq!(code, 0);
        assert!(!config.global.state_path.exists());
    }

    #[tokio::test]
    async fn no_subvolumes_selected_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let subvol = dir.path().join("home");
        std::fs::create_dir_all(&subvol).unwrap();
        let config = test_config(dir.path(), &subvol);
        let store = Arc::new(InMemoryObjectStore::new());
        let orchestrator = BackupOrchestrator::new(config, store, FakeRunner::default());
        let code = orchestrator
            .run(&BackupRequest {
                subvolume_names: Some(vec!["nonexistent".to_string()]),
                ..Default::default()
            })
            .await;
        assert_eq!(code, 2);
    }
}
