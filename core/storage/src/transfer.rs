//! Chunked transfer bookkeeping shared by the remote providers.
//!
//! Each chunked protocol keeps its state in an [`UploadSession`] value that
//! is threaded through the chunk loop, so the loop itself stays a plain
//! sequence of "read chunk, send chunk, record chunk" steps.

use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use siberian_common::{Error, Result};

/// Files above this size use the multipart / resumable protocols.
pub const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Chunk size for multipart parts and resumable session chunks.
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Server-side handle of an in-flight chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHandle {
    /// Explicit multipart upload id (S3).
    UploadId(String),
    /// Session URL returned in a response header (GCS, Drive).
    SessionUrl(String),
}

/// One acknowledged part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Transient state of one chunked upload. Never persisted.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub handle: SessionHandle,
    pub parts: Vec<CompletedPart>,
    pub bytes_sent: u64,
    pub total_size: u64,
    chunks_sent: u32,
}

impl UploadSession {
    pub fn new(handle: SessionHandle, total_size: u64) -> Self {
        Self {
            handle,
            parts: Vec::new(),
            bytes_sent: 0,
            total_size,
            chunks_sent: 0,
        }
    }

    /// Part number the next chunk will carry (1-based).
    pub fn next_part_number(&self) -> u32 {
        self.chunks_sent + 1
    }

    /// Whether a chunk of `len` bytes sent now would be the last one.
    pub fn is_final_chunk(&self, len: u64) -> bool {
        self.bytes_sent + len >= self.total_size
    }

    /// `Content-Range` header value for a chunk of `len` bytes sent now.
    pub fn content_range(&self, len: u64) -> String {
        if len == 0 {
            return format!("bytes */{}", self.total_size);
        }
        format!(
            "bytes {}-{}/{}",
            self.bytes_sent,
            self.bytes_sent + len - 1,
            self.total_size
        )
    }

    /// Record an acknowledged chunk. `etag` is kept for multipart protocols.
    pub fn record_chunk(&mut self, len: u64, etag: Option<String>) {
        self.chunks_sent += 1;
        if let Some(etag) = etag {
            self.parts.push(CompletedPart {
                part_number: self.chunks_sent,
                etag,
            });
        }
        self.bytes_sent += len;
    }

    pub fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    /// Fail unless exactly `total_size` bytes were acknowledged.
    pub fn verify_complete(&self) -> Result<()> {
        if self.bytes_sent != self.total_size {
            return Err(Error::Integrity(format!(
                "sent {} of {} bytes",
                self.bytes_sent, self.total_size
            )));
        }
        Ok(())
    }
}

/// Reads a file in fixed-size chunks.
pub struct ChunkReader {
    file: File,
    chunk_size: usize,
}

impl ChunkReader {
    /// Open `path` and return the reader together with the file size.
    pub async fn open(path: &Path, chunk_size: usize) -> Result<(Self, u64)> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok((Self { file, chunk_size }, size))
    }

    /// Next chunk, full-sized except at end of file. `None` at end of file.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = Vec::with_capacity(self.chunk_size);
        (&mut self.file)
            .take(self.chunk_size as u64)
            .read_to_end(&mut buf)
            .await?;
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::from(buf)))
        }
    }
}

/// Size of a local source file, failing on directories.
pub async fn source_size(path: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(Error::NotFound(format!(
            "Source is not a regular file: {}",
            path.display()
        )));
    }
    Ok(meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_bookkeeping() {
        let mut session = UploadSession::new(SessionHandle::UploadId("u1".into()), 12);

        assert_eq!(session.next_part_number(), 1);
        assert_eq!(session.content_range(5), "bytes 0-4/12");
        assert!(!session.is_final_chunk(5));
        session.record_chunk(5, Some("\"e1\"".into()));

        assert_eq!(session.content_range(5), "bytes 5-9/12");
        session.record_chunk(5, Some("\"e2\"".into()));

        assert!(session.is_final_chunk(2));
        session.record_chunk(2, Some("\"e3\"".into()));

        assert_eq!(session.parts.len(), 3);
        assert_eq!(session.parts[2].part_number, 3);
        session.verify_complete().unwrap();
    }

    #[test]
    fn test_short_transfer_is_an_integrity_error() {
        let mut session = UploadSession::new(SessionHandle::SessionUrl("s".into()), 10);
        session.record_chunk(6, None);
        assert!(matches!(session.verify_complete(), Err(Error::Integrity(_))));
    }

    #[tokio::test]
    async fn test_chunk_reader() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 11]).unwrap();

        let (mut reader, size) = ChunkReader::open(&path, 4).await.unwrap();
        assert_eq!(size, 11);

        let mut lens = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            lens.push(chunk.len());
        }
        assert_eq!(lens, vec![4, 4, 3]);
    }
}
