//! Splits a byte stream into fixed-size, strictly ordered chunks and
//! hashes each one as it is read.

use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk_size must be > 0")]
    InvalidChunkSize,
    #[error("chunk not fully drained")]
    NotDrained,
    #[error("io error reading chunk stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits `inner` into a strictly ordered sequence of bounded, hashing
/// sub-readers. Each `ChunkReader` borrows the `Chunker` exclusively for
/// its lifetime, so the compiler — not a runtime check — rejects any
/// attempt to start chunk *n+1* before chunk *n* is dropped.
pub struct Chunker<R> {
    inner: R,
    chunk_size: usize,
    next_index: u64,
    pending_byte: Option<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(inner: R, chunk_size: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize);
        }
        Ok(Self {
            inner,
            chunk_size,
            next_index: 0,
            pending_byte: None,
            eof: false,
        })
    }

    /// Unwraps the underlying reader. Only callable between chunks, since
    /// an outstanding `ChunkReader` holds an exclusive borrow.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Returns the next chunk reader, or `None` once the stream is
    /// exhausted. A zero-byte upstream yields `None` on the first call.
    pub async fn next_chunk(&mut self) -> Result<Option<ChunkReader<'_, R>>, ChunkError> {
        if self.eof {
            return Ok(None);
        }
        if self.pending_byte.is_none() {
            let mut probe = [0u8; 1];
            let n = self.inner.read(&mut probe).await?;
            if n == 0 {
                self.eof = true;
                return Ok(None);
            }
            self.pending_byte = Some(probe[0]);
        }
        let index = self.next_index;
        self.next_index += 1;
        let first_byte = self.pending_byte.take().expect("checked above");
        Ok(Some(ChunkReader {
            chunker: self,
            index,
            first_byte: Some(first_byte),
            remaining: self.chunk_size.saturating_sub(1),
            consumed: 1,
            hasher: {
                let mut h = Sha256::new();
                h.update([first_byte]);
                h
            },
            drained: false,
        }))
    }
}

/// A bounded reader over one chunk's bytes. Reading it drives the
/// underlying stream and incrementally updates the SHA-256 digest;
/// `size()`/`sha256()` are only valid once the reader hits EOF.
pub struct ChunkReader<'a, R> {
    chunker: &'a mut Chunker<R>,
    index: u64,
    first_byte: Option<u8>,
    remaining: usize,
    consumed: usize,
    hasher: Sha256,
    drained: bool,
}

impl<'a, R> ChunkReader<'a, R> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn size(&self) -> Result<usize, ChunkError> {
        if !self.drained {
            return Err(ChunkError::NotDrained);
        }
        Ok(self.consumed)
    }

    pub fn sha256(&self) -> Result<String, ChunkError> {
        if !self.drained {
            return Err(ChunkError::NotDrained);
        }
        Ok(hex::encode(self.hasher.clone().finalize()))
    }
}

impl<'a, R: AsyncRead + Unpin> AsyncRead for ChunkReader<'a, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if let Some(byte) = this.first_byte.take() {
            buf.put_slice(&[byte]);
            if this.remaining == 0 {
                this.drained = true;
            }
            return Poll::Ready(Ok(()));
        }

        if this.remaining == 0 {
            this.drained = true;
            return Poll::Ready(Ok(()));
        }

        let cap = buf.remaining().min(this.remaining);
        let mut limited = buf.take(cap);
        let before = limited.filled().len();
        match Pin::new(&mut this.chunker.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let produced = limited.filled().len() - before;
                let filled_slice = limited.filled()[before..].to_vec();
                // SAFETY-free: re-expose what the inner limited buf wrote.
                buf.advance(produced);
                this.hasher.update(&filled_slice);
                this.consumed += produced;
                this.remaining -= produced;
                if produced == 0 || this.remaining == 0 {
                    this.drained = true;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn drain(reader: &mut ChunkReader<'_, Cursor<Vec<u8>>>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn empty_stream_yields_no_chunks() {
        let mut chunker = Chunker::new(Cursor::new(Vec::new()), 4).unwrap();
        assert!(chunker.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunks_are_fixed_size_with_remainder_last() {
        let data = b"abcdefghij".to_vec(); // 10 bytes, chunk_size=4 -> 4,4,2
        let mut chunker = Chunker::new(Cursor::new(data.clone()), 4).unwrap();

        let mut sizes = Vec::new();
        let mut collected = Vec::new();
        let mut index = 0;
        loop {
            let mut reader = match chunker.next_chunk().await.unwrap() {
                Some(r) => r,
                None => break,
            };
            assert_eq!(reader.index(), index);
            let bytes = drain(&mut reader).await;
            collected.extend_from_slice(&bytes);
            sizes.push(reader.size().unwrap());
            let expected_hash = hex::encode(Sha256::digest(&bytes));
            assert_eq!(reader.sha256().unwrap(), expected_hash);
            index += 1;
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn size_before_drain_is_error() {
        let mut chunker = Chunker::new(Cursor::new(b"abcd".to_vec()), 4).unwrap();
        let reader = chunker.next_chunk().await.unwrap().unwrap();
        assert!(matches!(reader.size(), Err(ChunkError::NotDrained)));
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected() {
        assert!(matches!(
            Chunker::new(Cursor::new(Vec::new()), 0),
            Err(ChunkError::InvalidChunkSize)
        ));
    }

    #[tokio::test]
    async fn into_inner_recovers_the_underlying_reader_between_chunks() {
        let mut chunker = Chunker::new(Cursor::new(b"abcdefgh".to_vec()), 4).unwrap();
        {
            let mut reader = chunker.next_chunk().await.unwrap().unwrap();
            drain(&mut reader).await;
        }
        let cursor = chunker.into_inner();
        assert_eq!(cursor.position(), 4);
    }
}
