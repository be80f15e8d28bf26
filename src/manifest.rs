//! Manifest and current-pointer documents published to S3 alongside
//! chunk data. Struct fields are declared in alphabetical order so the
//! default `serde_json` struct serialization produces sorted-key,
//! 2-space-indented JSON without a custom serializer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object_store::ObjectStore;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Store(#[from] crate::object_store::ObjectStoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotInfo {
    pub name: String,
    pub parent_uuid: Option<String>,
    pub path: String,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEntry {
    pub etag: Option<String>,
    pub key: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub chunk_size: u64,
    pub chunks: Vec<ChunkEntry>,
    pub created_at: String,
    pub kind: String,
    pub parent_manifest: Option<String>,
    pub s3: serde_json::Value,
    pub snapshot: SnapshotInfo,
    pub subvolume: String,
    pub total_bytes: u64,
    pub version: u32,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(format!("{}\n", serde_json::to_string_pretty(self)?).into_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentPointer {
    pub created_at: String,
    pub kind: String,
    pub manifest_key: String,
}

impl CurrentPointer {
    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(format!("{}\n", serde_json::to_string_pretty(self)?).into_bytes())
    }
}

/// Writes the manifest object, then the current pointer — in that
/// order, so a reader that sees an updated pointer can always fetch the
/// manifest it names.
pub async fn publish_manifest<S: ObjectStore>(
    store: &S,
    manifest_key: &str,
    current_key: &str,
    manifest: &Manifest,
    pointer: &CurrentPointer,
    storage_class: &str,
    sse: Option<&str>,
) -> Result<(), ManifestError> {
    store
        .put_object(
            manifest_key,
            bytes::Bytes::from(manifest.to_json()?),
            storage_class,
            sse,
        )
        .await?;
    store
        .put_object(
            current_key,
            bytes::Bytes::from(pointer.to_json()?),
            storage_class,
            sse,
        )
        .await?;
    Ok(())
}
