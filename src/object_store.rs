//! Thin async wrapper over the subset of the S3 API the backup/restore
//! pipeline needs: single-shot put/get/head, archival-tier restore
//! requests, multipart upload, and prefix listing.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, RestoreRequest, Tier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("S3 request failed: {0}")]
    Request(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata returned by `head_object`, trimmed to the fields the restore
/// path inspects (storage class and the `x-amz-restore` header used by
/// `is_restore_ready`).
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub storage_class: Option<String>,
    pub restore_header: Option<String>,
    pub content_length: i64,
}

/// A completed part reference for `complete_multipart_upload`.
#[derive(Debug, Clone)]
pub struct CompletedPartRef {
    pub part_number: i32,
    pub etag: String,
}

/// A chunk-agnostic stream of an object's body, yielded in whatever
/// pieces the transport produces them. `get_object_stream` callers are
/// expected to re-buffer into their own fixed-size reads rather than
/// assume anything about item boundaries.
pub type ObjectByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ObjectStoreError>> + Send>>;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: &str,
        sse: Option<&str>,
    ) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, key: &str) -> Result<Bytes, ObjectStoreError>;

    /// Opens `key` as a stream instead of collecting the whole body up
    /// front, so a restore can hash and write it in fixed-size reads
    /// with bounded memory regardless of `chunk_size_bytes`.
    async fn get_object_stream(&self, key: &str) -> Result<ObjectByteStream, ObjectStoreError>;

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError>;

    async fn restore_object(
        &self,
        key: &str,
        days: i32,
        tier: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: &str,
        sse: Option<&str>,
    ) -> Result<String, ObjectStoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ObjectStoreError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartRef>,
    ) -> Result<(), ObjectStoreError>;

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn list_objects_v2(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Whether a usable set of credentials is resolvable right now,
    /// without making any request against the bucket itself. Backs the
    /// orchestrator's credentials gate: a run with no credentials exits
    /// cleanly instead of failing every object-store call one by one.
    async fn has_credentials(&self) -> bool;
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    sdk_config: SdkConfig,
}

impl S3ObjectStore {
    pub async fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint_url: Option<String>,
    ) -> Self {
        let mut builder =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.into()));
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let sdk_config = builder.load().await;
        Self {
            client: Client::new(&sdk_config),
            bucket: bucket.into(),
            sdk_config,
        }
    }
}

fn tier_from_str(tier: &str) -> Tier {
    match tier {
        "Expedited" => Tier::Expedited,
        "Bulk" => Tier::Bulk,
        _ => Tier::Standard,
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: &str,
        sse: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(storage_class.into())
            .body(ByteStream::from(body));
        if let Some(sse) = sse {
            req = req.server_side_encryption(sse.into());
        }
        req.send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?
            .into_bytes();
        Ok(bytes)
    }

    async fn get_object_stream(&self, key: &str) -> Result<ObjectByteStream, ObjectStoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        let stream = resp
            .body
            .map(|chunk| chunk.map_err(|e| ObjectStoreError::Request(e.to_string())));
        Ok(Box::pin(stream))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(ObjectMeta {
            storage_class: resp.storage_class().map(|c| c.as_str().to_string()),
            restore_header: resp.restore().map(|s| s.to_string()),
            content_length: resp.content_length().unwrap_or(0),
        })
    }

    async fn restore_object(
        &self,
        key: &str,
        days: i32,
        tier: &str,
    ) -> Result<(), ObjectStoreError> {
        let restore_request = RestoreRequest::builder()
            .days(days)
            .glacier_job_parameters(
                aws_sdk_s3::types::GlacierJobParameters::builder()
                    .tier(tier_from_str(tier))
                    .build()
                    .map_err(|e| ObjectStoreError::Request(e.to_string()))?,
            )
            .build();
        self.client
            .restore_object()
            .bucket(&self.bucket)
            .key(key)
            .restore_request(restore_request)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: &str,
        sse: Option<&str>,
    ) -> Result<String, ObjectStoreError> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(storage_class.into());
        if let Some(sse) = sse {
            req = req.server_side_encryption(sse.into());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Request("missing upload id".into()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ObjectStoreError> {
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        resp.e_tag()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Request("missing etag".into()))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartRef>,
    ) -> Result<(), ObjectStoreError> {
        let completed_parts = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(())
    }

    async fn list_objects_v2(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn has_credentials(&self) -> bool {
        let Some(provider) = self.sdk_config.credentials_provider() else {
            return false;
        };
        provider.provide_credentials().await.is_ok()
    }
}

/// In-process fake backing an `ObjectStore`, used by tests for the
/// uploader, manifest publication, and restore verification without
/// talking to real S3.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    multipart_parts: Mutex<HashMap<String, HashMap<i32, Bytes>>>,
    part_size_log: Mutex<HashMap<String, Vec<(i32, usize)>>>,
}

struct StoredObject {
    body: Bytes,
    storage_class: String,
    restore_header: Option<String>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: marks an already-put object as archived and not yet
    /// thawed, matching a freshly uploaded GLACIER/DEEP_ARCHIVE object.
    pub fn mark_archived(&self, key: &str) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(key) {
            obj.restore_header = None;
        }
    }

    /// Test hook: simulates a completed thaw-restore request.
    pub fn mark_restore_ready(&self, key: &str) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(key) {
            obj.restore_header = Some("ongoing-request=\"false\", expiry-date=\"...\"".to_string());
        }
    }

    /// Test hook: simulates an in-flight thaw-restore request.
    pub fn mark_restore_pending(&self, key: &str) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(key) {
            obj.restore_header = Some("ongoing-request=\"true\"".to_string());
        }
    }

    /// Test hook: the sizes of every part uploaded under `upload_id`, in
    /// `part_number` order. Recorded independently of `multipart_parts`
    /// so it survives `complete_multipart_upload` discarding the bodies.
    pub fn recorded_part_sizes(&self, upload_id: &str) -> Vec<usize> {
        let mut log = self
            .part_size_log
            .lock()
            .unwrap()
            .get(upload_id)
            .cloned()
            .unwrap_or_default();
        log.sort_by_key(|(part_number, _)| *part_number);
        log.into_iter().map(|(_, size)| size).collect()
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: &str,
        _sse: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body,
                storage_class: storage_class.to_string(),
                restore_header: None,
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn get_object_stream(&self, key: &str) -> Result<ObjectByteStream, ObjectStoreError> {
        let body = self.get_object(key).await?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok::<_, ObjectStoreError>(body)
        })))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(key)
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            storage_class: Some(obj.storage_class.clone()),
            restore_header: obj.restore_header.clone(),
            content_length: obj.body.len() as i64,
        })
    }

    async fn restore_object(
        &self,
        key: &str,
        _days: i32,
        _tier: &str,
    ) -> Result<(), ObjectStoreError> {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(key)
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        if obj.restore_header.is_none() {
            obj.restore_header = Some("ongoing-request=\"true\"".to_string());
        }
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        _storage_class: &str,
        _sse: Option<&str>,
    ) -> Result<String, ObjectStoreError> {
        let upload_id = format!("fake-upload-{key}");
        self.multipart_parts
            .lock()
            .unwrap()
            .insert(upload_id.clone(), HashMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ObjectStoreError> {
        let size = body.len();
        let mut parts = self.multipart_parts.lock().unwrap();
        let entry = parts
            .get_mut(upload_id)
            .ok_or_else(|| ObjectStoreError::NotFound(upload_id.to_string()))?;
        entry.insert(part_number, body);
        drop(parts);
        self.part_size_log
            .lock()
            .unwrap()
            .entry(upload_id.to_string())
            .or_default()
            .push((part_number, size));
        Ok(format!("etag-{part_number}"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        mut parts: Vec<CompletedPartRef>,
    ) -> Result<(), ObjectStoreError> {
        parts.sort_by_key(|p| p.part_number);
        let staged = self
            .multipart_parts
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| ObjectStoreError::NotFound(upload_id.to_string()))?;
        let mut body = Vec::new();
        for part in &parts {
            let chunk = staged
                .get(&part.part_number)
                .ok_or_else(|| ObjectStoreError::Request("missing part".into()))?;
            body.extend_from_slice(chunk);
        }
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body: Bytes::from(body),
                storage_class: "STANDARD".to_string(),
                restore_header: None,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        self.multipart_parts.lock().unwrap().remove(upload_id);
        Ok(())
    }

    async fn list_objects_v2(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn has_credentials(&self) -> bool {
        true
    }
}

/// True when `storage_class` names one of the archival tiers that must
/// be thawed with `restore_object` before `get_object` will return data.
pub fn is_archival_storage_class(storage_class: &str) -> bool {
    matches!(storage_class, "GLACIER" | "DEEP_ARCHIVE" | "GLACIER_IR")
}

/// Parses the `x-amz-restore` header value to decide whether a thaw
/// request has finished (`ongoing-request="false"`).
pub fn is_restore_ready(restore_header: Option<&str>) -> bool {
    match restore_header {
        Some(header) => header.contains("ongoing-request=\"false\""),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archival_storage_classes_are_classified_correctly() {
        assert!(is_archival_storage_class("GLACIER"));
        assert!(is_archival_storage_class("DEEP_ARCHIVE"));
        assert!(is_archival_storage_class("GLACIER_IR"));
        assert!(!is_archival_storage_class("STANDARD"));
    }

    #[test]
    fn restore_ready_parses_header() {
        assert!(!is_restore_ready(None));
        assert!(!is_restore_ready(Some("ongoing-request=\"true\"")));
        assert!(is_restore_ready(Some(
            "ongoing-request=\"false\", expiry-date=\"Fri, 1 Jan 2027\""
        )));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_put_get() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("k1", Bytes::from_static(b"hello"), "STANDARD", None)
            .await
            .unwrap();
        let got = store.get_object("k1").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn in_memory_store_streams_the_full_body() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("k1", Bytes::from_static(b"hello world"), "STANDARD", None)
            .await
            .unwrap();
        let mut stream = store.get_object_stream("k1").await.unwrap();
        let mut collected = Vec::new();
        while let Some(piece) = stream.next().await {
            collected.extend_from_slice(&piece.unwrap());
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn in_memory_store_multipart_assembles_in_order() {
        let store = InMemoryObjectStore::new();
        let upload_id = store
            .create_multipart_upload("big", "STANDARD", None)
            .await
            .unwrap();
        let e2 = store
            .upload_part("big", &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = store
            .upload_part("big", &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store
            .complete_multipart_upload(
                "big",
                &upload_id,
                vec![
                    CompletedPartRef {
                        part_number: 2,
                        etag: e2,
                    },
                    CompletedPartRef {
                        part_number: 1,
                        etag: e1,
                    },
                ],
            )
            .await
            .unwrap();
        let got = store.get_object("big").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn restore_object_transitions_to_ready_via_test_hook() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("archived", Bytes::from_static(b"data"), "DEEP_ARCHIVE", None)
            .await
            .unwrap();
        store.restore_object("archived", 3, "Standard").await.unwrap();
        let meta = store.head_object("archived").await.unwrap();
        assert!(!is_restore_ready(meta.restore_header.as_deref()));
        store.mark_restore_ready("archived");
        let meta = store.head_object("archived").await.unwrap();
        assert!(is_restore_ready(meta.restore_header.as_deref()));
    }
}
