use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::StorageError;

/// An object fetched from the store together with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    /// Opaque version token (an ETag for S3). `None` when the store has none.
    pub version: Option<String>,
}

/// Precondition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    /// Unconditional overwrite.
    #[default]
    None,
    /// Write only if the key does not exist (`If-None-Match: *`).
    IfAbsent,
    /// Write only if the current version matches (`If-Match`).
    IfMatch(String),
}

/// Capability surface over a remote keyed-blob service.
///
/// Implementations map a rejected [`WriteCondition`] to
/// [`StorageError::PreconditionFailed`]; every other failure is propagated
/// as-is. Deleting a key that does not exist is not an error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Whether `put` honours [`WriteCondition::IfAbsent`] and
    /// [`WriteCondition::IfMatch`].
    fn supports_conditional_writes(&self) -> bool;

    /// List every key under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Fetch an object. Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StorageError>;

    /// Stream an object body into `writer`, returning the number of bytes copied.
    async fn download_to(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError>;

    /// Write an in-memory payload.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<(), StorageError>;

    /// Upload a local file, streaming it from disk. Returns the byte count.
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete several keys in as few round trips as the backend allows.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Server-side copy of `source` to `destination`.
    async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError>;
}
