use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::StorageError;

/// Type alias for a boxed async reader.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Tag returned by the object store for one uploaded part of a multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    pub etag: String,
}

/// Remote object storage holding the bytes behind pool entries.
///
/// Keys are opaque; durability and replication are the backend's business.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a complete object in a single request.
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Store everything an async reader yields as one object. Returns the byte count.
    async fn put_stream(
        &self,
        key: &str,
        mut reader: BoxReader,
        content_type: &str,
    ) -> Result<u64, StorageError> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let len = buf.len() as u64;
        self.put_object(key, buf, content_type).await?;
        Ok(len)
    }

    /// Open a multipart session and return its upload id.
    async fn initiate_multipart(&self, key: &str, content_type: &str)
    -> Result<String, StorageError>;

    /// Upload one part of an open session.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError>;

    /// Finalize a session from its parts, ordered by part number.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    /// Discard a session and every part uploaded to it.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// Produce a time-limited GET URL for an object.
    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, StorageError>;
}
