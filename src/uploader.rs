//! Streams chunk data into S3, switching between a single `put_object`
//! and a multipart upload depending on size, with a bounded-concurrency
//! worker pool dispatching parts and exponential-backoff-with-jitter
//! retries around each part.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{info, warn};

use crate::object_store::{CompletedPartRef, ObjectStore, ObjectStoreError};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload of {key} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: ObjectStoreError,
    },
    #[error("object store error: {0}")]
    Store(#[from] ObjectStoreError),
    #[error("io error reading upload source: {0}")]
    Io(#[from] std::io::Error),
    #[error("spool_size_bytes must be >= 5 MiB when spooling is enabled")]
    SpoolTooSmall,
}

/// On-disk staging for in-flight multipart parts, bounding how much
/// unsent data the uploader buffers in memory at once.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub dir: PathBuf,
    pub size_bytes: u64,
}

impl SpoolConfig {
    fn validate(&self) -> Result<(), UploadError> {
        if self.size_bytes < 5 * 1024 * 1024 {
            return Err(UploadError::SpoolTooSmall);
        }
        Ok(())
    }

    /// Caps in-flight parts so spooled bytes never exceed `size_bytes`.
    fn max_in_flight(&self, part_size_bytes: usize) -> usize {
        ((self.size_bytes as usize) / part_size_bytes.max(1)).max(1)
    }
}

/// Exponential backoff with full jitter: `delay = min(max_delay,
/// base_delay * 2^(attempt-1))`, then a uniform-random sleep in
/// `[0, delay]`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(30.0),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let cap = self.delay_for_attempt(attempt);
        let jittered = rand::thread_rng().gen_range(0.0..=cap.as_secs_f64().max(0.0));
        Duration::from_secs_f64(jittered)
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub storage_class: String,
    pub sse: Option<String>,
    pub part_size_bytes: usize,
    pub multipart_threshold_bytes: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub spool: Option<SpoolConfig>,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub key: String,
    pub size_bytes: u64,
    pub part_count: usize,
}

pub struct Uploader<S: ObjectStore> {
    store: Arc<S>,
    config: UploadConfig,
}

impl<S: ObjectStore + 'static> Uploader<S> {
    pub fn new(store: Arc<S>, config: UploadConfig) -> Result<Self, UploadError> {
        if let Some(spool) = &config.spool {
            spool.validate()?;
        }
        Ok(Self { store, config })
    }

    /// Concurrency actually used for part dispatch: the configured value,
    /// further capped by the spool's `size_bytes / part_size_bytes` when
    /// spooling is enabled.
    fn effective_concurrency(&self) -> usize {
        match &self.config.spool {
            Some(spool) => self
                .config
                .concurrency
                .min(spool.max_in_flight(self.config.part_size_bytes)),
            None => self.config.concurrency,
        }
    }

    /// Uploads everything `reader` yields to `key`. Reads are staged one
    /// part at a time into memory (bounding memory use to
    /// `part_size_bytes * concurrency`), which both drives the
    /// single-shot/multipart decision and makes each part independently
    /// retryable without re-reading the source stream.
    pub async fn upload_reader<R: AsyncRead + Unpin + Send>(
        &self,
        key: &str,
        mut reader: R,
    ) -> Result<UploadResult, UploadError> {
        let first_part = read_up_to(&mut reader, self.config.multipart_threshold_bytes).await?;

        if first_part.len() < self.config.multipart_threshold_bytes {
            // Confirmed EOF within the single-shot threshold.
            let size = first_part.len() as u64;
            self.put_with_retry(key, first_part).await?;
            info!(event = "upload_single_shot", key, size, "uploaded object");
            return Ok(UploadResult {
                key: key.to_string(),
                size_bytes: size,
                part_count: 1,
            });
        }

        // `first_part` was only read to decide single-shot vs. multipart;
        // re-feed it ahead of the rest of the source so every part
        // handed to `drive_multipart` is `part_size_bytes`, not
        // threshold-sized.
        let chained = PrefixedReader::new(first_part, reader);
        self.multipart_upload(key, chained).await
    }

    async fn put_with_retry(&self, key: &str, body: Bytes) -> Result<(), UploadError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .put_object(
                    key,
                    body.clone(),
                    &self.config.storage_class,
                    self.config.sse.as_deref(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(source) if attempt < self.config.retry.max_attempts => {
                    warn!(event = "upload_retry", key, attempt, error = %source, "retrying put_object");
                    tokio::time::sleep(self.config.retry.jittered_delay(attempt)).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(UploadError::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Uploads one part, spooling it to disk first when spooling is
    /// configured so the caller's in-memory copy can be dropped while
    /// the part sits in the `FuturesUnordered` queue awaiting a worker
    /// slot. The spool file is removed once the upload attempt (success
    /// or exhausted retries) finishes.
    async fn upload_part_spooled(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPartRef, UploadError> {
        let Some(spool) = &self.config.spool else {
            return self
                .upload_part_with_retry(key, upload_id, part_number, body)
                .await;
        };

        let spool_path = spool
            .dir
            .join(format!("{upload_id}-{part_number:05}.part"));
        tokio::fs::create_dir_all(&spool.dir).await?;
        {
            let mut file = tokio::fs::File::create(&spool_path).await?;
            file.write_all(&body).await?;
            file.flush().await?;
        }
        drop(body);

        let result = self
            .upload_part_from_spool(key, upload_id, part_number, &spool_path)
            .await;
        let _ = tokio::fs::remove_file(&spool_path).await;
        result
    }

    async fn upload_part_from_spool(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        spool_path: &std::path::Path,
    ) -> Result<CompletedPartRef, UploadError> {
        let body = Bytes::from(tokio::fs::read(spool_path).await?);
        self.upload_part_with_retry(key, upload_id, part_number, body)
            .await
    }

    async fn upload_part_with_retry(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPartRef, UploadError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .upload_part(key, upload_id, part_number, body.clone())
                .await
            {
                Ok(etag) => return Ok(CompletedPartRef { part_number, etag }),
                Err(source) if attempt < self.config.retry.max_attempts => {
                    warn!(
                        event = "upload_part_retry",
                        key, upload_id, part_number, attempt, error = %source,
                        "retrying upload_part"
                    );
                    tokio::time::sleep(self.config.retry.jittered_delay(attempt)).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(UploadError::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    async fn multipart_upload<R: AsyncRead + Unpin + Send>(
        &self,
        key: &str,
        mut reader: R,
    ) -> Result<UploadResult, UploadError> {
        let upload_id = self
            .store
            .create_multipart_upload(key, &self.config.storage_class, self.config.sse.as_deref())
            .await?;

        let outcome = self.drive_multipart(key, &upload_id, &mut reader).await;

        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                if let Err(abort_err) = self.store.abort_multipart_upload(key, &upload_id).await {
                    warn!(
                        event = "multipart_abort_failed",
                        key, upload_id, error = %abort_err,
                        "failed to abort multipart upload after earlier failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn drive_multipart<R: AsyncRead + Unpin + Send>(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut R,
    ) -> Result<UploadResult, UploadError> {
        let mut total_bytes = 0u64;
        let mut next_part_number = 1i32;
        let mut parts = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        let mut pending = None;
        let mut source_exhausted = false;

        loop {
            if pending.is_none() && !source_exhausted {
                let next = read_up_to(reader, self.config.part_size_bytes).await?;
                if next.is_empty() {
                    source_exhausted = true;
                } else {
                    total_bytes += next.len() as u64;
                    if next.len() < self.config.part_size_bytes {
                        source_exhausted = true;
                    }
                    pending = Some(next);
                }
            }

            if let Some(body) = pending.take() {
                let part_number = next_part_number;
                next_part_number += 1;
                in_flight.push(self.upload_part_spooled(key, upload_id, part_number, body));
            }

            if in_flight.len() >= self.effective_concurrency()
                || (source_exhausted && pending.is_none())
            {
                match in_flight.next().await {
                    Some(result) => parts.push(result?),
                    None => {
                        if source_exhausted {
                            break;
                        }
                    }
                }
            }
        }

        while let Some(result) = in_flight.next().await {
            parts.push(result?);
        }

        parts.sort_by_key(|p| p.part_number);
        let part_count = parts.len();
        self.store
            .complete_multipart_upload(key, upload_id, parts)
            .await?;

        info!(
            event = "upload_multipart_complete",
            key, total_bytes, part_count, "uploaded object via multipart"
        );

        Ok(UploadResult {
            key: key.to_string(),
            size_bytes: total_bytes,
            part_count,
        })
    }
}

/// Re-exposes an already-read `Bytes` prefix ahead of the reader it was
/// pulled from, so a buffer read to make the single-shot/multipart
/// decision can still be re-sliced into `part_size_bytes` parts.
struct PrefixedReader<R> {
    prefix: Bytes,
    inner: R,
}

impl<R> PrefixedReader<R> {
    fn new(prefix: Bytes, inner: R) -> Self {
        Self { prefix, inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix = this.prefix.slice(n..);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Reads up to `limit` bytes from `reader`, returning fewer only at EOF.
async fn read_up_to<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Bytes, std::io::Error> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use std::io::Cursor;

    fn config(threshold: usize, part_size: usize) -> UploadConfig {
        UploadConfig {
            storage_class: "STANDARD".to_string(),
            sse: Some("AES256".to_string()),
            part_size_bytes: part_size,
            multipart_threshold_bytes: threshold,
            concurrency: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            spool: None,
        }
    }

    #[tokio::test]
    async fn small_body_uses_single_shot_put() {
        let store = Arc::new(InMemoryObjectStore::new());
        let uploader = Uploader::new(store.clone(), config(1024, 256)).unwrap();
        let result = uploader
            .upload_reader("k", Cursor::new(b"hello world".to_vec()))
            .await
            .unwrap();
        assert_eq!(result.part_count, 1);
        assert_eq!(result.size_bytes, 11);
        assert_eq!(store.get_object("k").await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn large_body_uses_multipart_and_preserves_order() {
        let store = Arc::new(InMemoryObjectStore::new());
        let uploader = Uploader::new(store.clone(), config(8, 4)).unwrap();
        let data = b"abcdefghijklmno".to_vec(); // 15 bytes, threshold 8, part size 4
        let result = uploader
            .upload_reader("big", Cursor::new(data.clone()))
            .await
            .unwrap();
        assert!(result.part_count > 1);
        assert_eq!(result.size_bytes, data.len() as u64);
        assert_eq!(store.get_object("big").await.unwrap(), Bytes::from(data));

        // Parts must be sliced at part_size (4), not at the
        // threshold-sized (8) buffer used only for the single-shot
        // decision: [4, 4, 4, 3], never [8, 4, 3].
        let part_sizes = store.recorded_part_sizes("fake-upload-big");
        assert_eq!(part_sizes, vec![4, 4, 4, 3]);
    }

    #[tokio::test]
    async fn empty_source_uploads_empty_object() {
        let store = Arc::new(InMemoryObjectStore::new());
        let uploader = Uploader::new(store.clone(), config(8, 4)).unwrap();
        let result = uploader
            .upload_reader("empty", Cursor::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(result.size_bytes, 0);
        assert_eq!(result.part_count, 1);
    }

    #[test]
    fn spool_below_minimum_size_is_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut cfg = config(8, 4);
        cfg.spool = Some(SpoolConfig {
            dir: PathBuf::from("/tmp/spool-test"),
            size_bytes: 1024,
        });
        let err = Uploader::new(store, cfg).unwrap_err();
        assert!(matches!(err, UploadError::SpoolTooSmall));
    }

    #[test]
    fn spool_caps_effective_concurrency() {
        let spool = SpoolConfig {
            dir: PathBuf::from("/tmp/spool-test"),
            size_bytes: 10 * 1024 * 1024,
        };
        // 10 MiB spool / 4 MiB parts = 2 in flight, below the configured concurrency of 8.
        assert_eq!(spool.max_in_flight(4 * 1024 * 1024), 2);
    }

    #[tokio::test]
    async fn spooled_upload_writes_and_cleans_up_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let mut cfg = config(8, 4);
        cfg.spool = Some(SpoolConfig {
            dir: dir.path().to_path_buf(),
            size_bytes: 5 * 1024 * 1024,
        });
        let uploader = Uploader::new(store.clone(), cfg).unwrap();
        let data = b"abcdefghijklmno".to_vec();
        let result = uploader
            .upload_reader("spooled", Cursor::new(data.clone()))
            .await
            .unwrap();
        assert!(result.part_count > 1);
        assert_eq!(store.get_object("spooled").await.unwrap(), Bytes::from(data));
        let leftover: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftover.is_empty(), "spool files should be cleaned up after upload");
    }
}
