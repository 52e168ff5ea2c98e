//! Durable key-value storage used by the credential store, the cache and the
//! mutation queue.
//!
//! Backends must make `put` atomic: a reader sees either the previous value
//! or the new one, never a torn write.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SyncError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Stored value for {0} is corrupt")]
    Corrupt(String),
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::StorageUnavailable(e.to_string())
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
