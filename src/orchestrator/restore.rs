//! Drives one restore run: resolve the manifest chain back to its full
//! backup, thaw archived chunks, replay each manifest through `btrfs
//! receive`, then verify.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::{calculate_metrics, format_throughput};
use crate::object_store::{is_archival_storage_class, is_restore_ready, ObjectStore};
use crate::receive_process::ReceiveProcess;
use crate::verify::{verify_restore, SubvolumeShowRunner};

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("missing object {0}")]
    MissingObject(String),
    #[error("{0} invalid json: {1}")]
    InvalidJson(String, serde_json::Error),
    #[error("{0} missing manifest_key")]
    MissingManifestKey(String),
    #[error("manifest chain loop detected at {0}")]
    ChainLoop(String),
    #[error("manifest chain does not end in full backup")]
    ChainNotFull,
    #[error("{0} missing kind")]
    MissingKind(String),
    #[error("{0} invalid parent_manifest")]
    InvalidParentManifest(String),
    #[error("{0} missing chunks")]
    MissingChunks(String),
    #[error("{0} has invalid chunk entry")]
    InvalidChunkEntry(String),
    #[error("{0} missing snapshot path")]
    MissingSnapshotPath(String),
    #[error("restore timeout waiting for {0}")]
    RestoreTimeout(String),
    #[error("hash mismatch for {0}")]
    HashMismatch(String),
    #[error("target path already exists: {0}")]
    TargetExists(PathBuf),
    #[error("received subvolume missing: {0}")]
    ReceivedSubvolumeMissing(PathBuf),
    #[error("restore stream failed: {0}")]
    StreamFailed(String),
    #[error("object store error: {0}")]
    Store(#[from] crate::object_store::ObjectStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("receive process error: {0}")]
    Receive(#[from] crate::receive_process::ReceiveError),
    #[error("verification failed: {0}")]
    Verify(#[from] crate::verify::VerifyError),
}

/// Read buffer for `download_and_verify_chunks`, independent of
/// `chunk_size_bytes` (which can be as large as the default 200 GiB) so
/// a chunk is hashed and written in fixed-size pieces instead of held
/// in memory whole.
const DOWNLOAD_READ_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub key: String,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ManifestInfo {
    pub key: String,
    pub kind: String,
    pub parent_manifest: Option<String>,
    pub chunks: Vec<ChunkInfo>,
    pub storage_class: Option<String>,
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestPayload {
    kind: Option<String>,
    parent_manifest: Option<String>,
    chunks: Option<Vec<ChunkPayload>>,
    #[serde(default)]
    s3: serde_json::Value,
    snapshot: Option<SnapshotPayload>,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    key: Option<String>,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotPayload {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointerPayload {
    manifest_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub subvolume: String,
    pub target: PathBuf,
    pub manifest_key: Option<String>,
    pub restore_timeout: Option<u64>,
    pub wait_restore: Option<bool>,
    pub verify: Option<String>,
}

pub struct RestoreOrchestrator<S: ObjectStore, R: SubvolumeShowRunner> {
    config: Config,
    store: S,
    show_runner: R,
}

impl<S: ObjectStore, R: SubvolumeShowRunner> RestoreOrchestrator<S, R> {
    pub fn new(config: Config, store: S, show_runner: R) -> Self {
        Self {
            config,
            store,
            show_runner,
        }
    }

    pub async fn run(&self, request: &RestoreRequest) -> i32 {
        if !self.store.has_credentials().await {
            error!(event = "restore_no_credentials", status = "failed");
            return 1;
        }
        let prefix = super::backup::build_prefix(&self.config.s3.prefix);
        let current_key = format!("{prefix}subvol/{}/current.json", request.subvolume);
        let manifest_key = match &request.manifest_key {
            Some(key) => key.clone(),
            None => match self.fetch_current_manifest_key(&current_key).await {
                Ok(key) => key,
                Err(err) => {
                    error!(event = "restore_current_failed", error = %err);
                    return 1;
                }
            },
        };

        let manifests = match self.resolve_manifest_chain(&manifest_key).await {
            Ok(manifests) => manifests,
            Err(err) => {
                error!(event = "restore_manifest_failed", error = %err);
                return 1;
            }
        };

        let wait_for_restore = request.wait_restore.unwrap_or(self.config.restore.wait_for_restore);
        let restore_timeout = request
            .restore_timeout
            .unwrap_or(self.config.restore.restore_timeout_seconds);

        let start = Instant::now();
        let total_bytes = match self
            .restore_chain(&manifests, &request.target, wait_for_restore, restore_timeout)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(event = "restore_failed", error = %err);
                return 1;
            }
        };
        let elapsed = start.elapsed().as_secs_f64();
        let metrics = calculate_metrics(total_bytes, elapsed);
        info!(
            event = "restore_metrics",
            subvolume = %request.subvolume,
            total_bytes = metrics.total_bytes,
            elapsed_seconds = metrics.elapsed_seconds,
            throughput = %format_throughput(metrics.throughput_bytes_per_sec()),
        );

        let verify_mode = request
            .verify
            .clone()
            .unwrap_or_else(|| self.config.restore.verify_mode.clone());
        if self.run_verify(&verify_mode, &manifests, &request.target).await != 0 {
            return 1;
        }
        info!(event = "restore_complete", status = "ok");
        0
    }

    async fn run_verify(&self, verify_mode: &str, manifests: &[ManifestInfo], target: &Path) -> i32 {
        if verify_mode == "none" {
            info!(event = "restore_verify_skipped", mode = "none");
            return 0;
        }
        let snapshot_path = manifests.last().and_then(|m| m.snapshot_path.as_deref());
        let source_path = snapshot_path.map(expand_home);
        if let Some(source_path) = &source_path {
            if !source_path.exists() {
                info!(event = "restore_verify_source_missing", path = %source_path.display());
            }
        } else {
            info!(event = "restore_verify_source_missing", path = "unknown");
        }
        match verify_restore(
            source_path.as_deref(),
            target,
            verify_mode,
            self.config.restore.sample_max_files,
            &self.show_runner,
        )
        .await
        {
            Ok(()) => {
                info!(event = "restore_verify_complete", status = "ok", mode = %verify_mode);
                0
            }
            Err(err) => {
                error!(event = "restore_verify_failed", error = %err);
                1
            }
        }
    }

    async fn fetch_current_manifest_key(&self, current_key: &str) -> Result<String, RestoreError> {
        let payload: PointerPayload = self.fetch_json(current_key).await?;
        payload
            .manifest_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| RestoreError::MissingManifestKey(current_key.to_string()))
    }

    /// Walks `parent_manifest` links back to a full backup, returning
    /// the chain ordered oldest (full) to newest.
    async fn resolve_manifest_chain(&self, start_key: &str) -> Result<Vec<ManifestInfo>, RestoreError> {
        let mut manifests = Vec::new();
        let mut seen = HashSet::new();
        let mut current_key = start_key.to_string();
        loop {
            if !seen.insert(current_key.clone()) {
                return Err(RestoreError::ChainLoop(current_key));
            }
            let manifest = self.fetch_manifest(&current_key).await?;
            let parent = manifest.parent_manifest.clone();
            manifests.push(manifest);
            match parent {
                Some(parent_key) => current_key = parent_key,
                None => break,
            }
        }
        manifests.reverse();
        if manifests.first().map(|m| m.kind.as_str()) != Some("full") {
            return Err(RestoreError::ChainNotFull);
        }
        Ok(manifests)
    }

    async fn fetch_manifest(&self, key: &str) -> Result<ManifestInfo, RestoreError> {
        let payload: ManifestPayload = self.fetch_json(key).await?;
        parse_manifest(payload, key)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, RestoreError> {
        let body = self
            .store
            .get_object(key)
            .await
            .map_err(|_| RestoreError::MissingObject(key.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| RestoreError::InvalidJson(key.to_string(), e))
    }

    /// Requests archival restores for every chunk in `manifest` (when
    /// its storage class needs it) and polls `head_object` until all
    /// are thawed, with jittered exponential backoff, or times out.
    async fn ensure_chunks_restored(
        &self,
        chunks: &[ChunkInfo],
        storage_class: Option<&str>,
        restore_tier: &str,
        timeout_seconds: u64,
    ) -> Result<(), RestoreError> {
        let Some(storage_class) = storage_class else {
            return Ok(());
        };
        if !is_archival_storage_class(storage_class) {
            return Ok(());
        }
        for chunk in chunks {
            self.store.restore_object(&chunk.key, 1, restore_tier).await?;
        }
        let deadline = Instant::now() + Duration::from_secs(timeout_seconds);
        let mut pending: HashSet<&str> = chunks.iter().map(|c| c.key.as_str()).collect();
        let mut delay = Duration::from_secs_f64(1.0);
        while !pending.is_empty() {
            if Instant::now() >= deadline {
                let mut missing: Vec<&str> = pending.into_iter().collect();
                missing.sort();
                return Err(RestoreError::RestoreTimeout(missing.join(", ")));
            }
            let mut ready = Vec::new();
            for key in pending.iter() {
                let meta = self.store.head_object(key).await?;
                if is_restore_ready(meta.restore_header.as_deref()) {
                    ready.push(*key);
                }
            }
            for key in ready {
                pending.remove(key);
            }
            if !pending.is_empty() {
                let jitter = rand::thread_rng().gen_range(0.0..=0.1) * delay.as_secs_f64();
                tokio::time::sleep(delay + Duration::from_secs_f64(jitter)).await;
                delay = Duration::from_secs_f64((delay.as_secs_f64() * 2.0).min(30.0));
            }
        }
        Ok(())
    }

    async fn download_and_verify_chunks(
        &self,
        chunks: &[ChunkInfo],
        receiver: &mut ReceiveProcess,
    ) -> Result<u64, RestoreError> {
        let mut total_bytes = 0u64;
        for chunk in chunks {
            let mut stream = self.store.get_object_stream(&chunk.key).await?;
            let mut hasher = Sha256::new();
            let mut buf: Vec<u8> = Vec::with_capacity(DOWNLOAD_READ_BUFFER_BYTES);
            while let Some(piece) = stream.next().await {
                buf.extend_from_slice(&piece?);
                while buf.len() >= DOWNLOAD_READ_BUFFER_BYTES {
                    let read: Vec<u8> = buf.drain(..DOWNLOAD_READ_BUFFER_BYTES).collect();
                    hasher.update(&read);
                    receiver.write_chunk(&read).await?;
                    total_bytes += read.len() as u64;
                }
            }
            if !buf.is_empty() {
                hasher.update(&buf);
                total_bytes += buf.len() as u64;
                receiver.write_chunk(&buf).await?;
            }
            let digest = hex::encode(hasher.finalize());
            if digest != chunk.sha256 {
                return Err(RestoreError::HashMismatch(chunk.key.clone()));
            }
        }
        Ok(total_bytes)
    }

    /// Replays every manifest in `manifests` into `target`, thawing
    /// archived chunks first when `wait_for_restore` is set.
    async fn restore_chain(
        &self,
        manifests: &[ManifestInfo],
        target: &Path,
        wait_for_restore: bool,
        restore_timeout_seconds: u64,
    ) -> Result<u64, RestoreError> {
        if target.exists() {
            return Err(RestoreError::TargetExists(target.to_path_buf()));
        }
        let Some(receive_dir) = target.parent() else {
            return Err(RestoreError::TargetExists(target.to_path_buf()));
        };
        tokio::fs::create_dir_all(receive_dir).await?;

        let mut total_bytes = 0u64;
        for manifest in manifests {
            if wait_for_restore {
                self.ensure_chunks_restored(
                    &manifest.chunks,
                    manifest.storage_class.as_deref(),
                    &self.config.restore.restore_tier,
                    restore_timeout_seconds,
                )
                .await?;
            }
            let (created, bytes_written) = self.apply_manifest_stream(manifest, receive_dir).await?;
            total_bytes += bytes_written;
            if created != target {
                if created.exists() {
                    if target.exists() {
                        delete_subvolume(target).await?;
                    }
                    tokio::fs::rename(&created, target).await?;
                } else {
                    return Err(RestoreError::ReceivedSubvolumeMissing(created));
                }
            }
        }
        if target.exists() {
            set_subvolume_writable(target).await?;
        }
        Ok(total_bytes)
    }

    async fn apply_manifest_stream(
        &self,
        manifest: &ManifestInfo,
        receive_dir: &Path,
    ) -> Result<(PathBuf, u64), RestoreError> {
        let snapshot_path = manifest
            .snapshot_path
            .as_deref()
            .ok_or_else(|| RestoreError::MissingSnapshotPath(manifest.key.clone()))?;
        let subvol_name = Path::new(snapshot_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut receiver = ReceiveProcess::spawn(receive_dir).await?;
        match self.download_and_verify_chunks(&manifest.chunks, &mut receiver).await {
            Ok(bytes_written) => match receiver.finish().await {
                Ok(()) => Ok((receive_dir.join(&subvol_name), bytes_written)),
                Err(err) => Err(RestoreError::StreamFailed(err.to_string())),
            },
            Err(stream_error) => {
                let stderr = receiver.kill_and_collect_stderr(Duration::from_secs(5)).await;
                let message = if stderr.is_empty() {
                    format!("{stream_error}")
                } else {
                    format!("{stream_error}; btrfs receive error: {stderr}")
                };
                warn!(event = "restore_stream_failed", subvolume = %subvol_name, error = %message);
                Err(RestoreError::StreamFailed(message))
            }
        }
    }
}

fn parse_manifest(payload: ManifestPayload, key: &str) -> Result<ManifestInfo, RestoreError> {
    let kind = payload
        .kind
        .filter(|k| !k.is_empty())
        .ok_or_else(|| RestoreError::MissingKind(key.to_string()))?;
    let parent_manifest = payload.parent_manifest.filter(|p| !p.is_empty());
    let chunks_payload = payload
        .chunks
        .filter(|c| !c.is_empty())
        .ok_or_else(|| RestoreError::MissingChunks(key.to_string()))?;
    let mut chunks = Vec::with_capacity(chunks_payload.len());
    for chunk in chunks_payload {
        let chunk_key = chunk
            .key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RestoreError::InvalidChunkEntry(key.to_string()))?;
        let sha256 = chunk
            .sha256
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RestoreError::InvalidChunkEntry(key.to_string()))?;
        chunks.push(ChunkInfo { key: chunk_key, sha256 });
    }
    let storage_class = payload
        .s3
        .get("storage_class")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let snapshot_path = payload.snapshot.and_then(|s| s.path).filter(|p| !p.is_empty());
    Ok(ManifestInfo {
        key: key.to_string(),
        kind,
        parent_manifest,
        chunks,
        storage_class,
        snapshot_path,
    })
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

async fn delete_subvolume(path: &Path) -> Result<(), RestoreError> {
    let mut command = tokio::process::Command::new("btrfs");
    command.arg("subvolume").arg("delete").arg(path);
    crate::pathenv::ensure_sbin_on_command_path(&mut command);
    let output = command.output().await?;
    if !output.status.success() {
        return Err(RestoreError::StreamFailed(format!(
            "btrfs subvolume delete failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn set_subvolume_writable(path: &Path) -> Result<(), RestoreError> {
    let mut command = tokio::process::Command::new("btrfs");
    command
        .arg("property")
        .arg("set")
        .arg("-f")
        .arg("-ts")
        .arg(path)
        .arg("ro")
        .arg("false");
    crate::pathenv::ensure_sbin_on_command_path(&mut command);
    let output = command.output().await?;
    if !output.status.success() {
        return Err(RestoreError::StreamFailed(format!(
            "btrfs property set failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
