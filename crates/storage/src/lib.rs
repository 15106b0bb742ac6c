//! Blob storage contract: where produced images land.
//!
//! Cloud object stores (S3-compatible) plug in behind the same trait; this
//! crate ships a local-filesystem backend and an in-memory fake.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;

/// Blob store error.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob write failed: {0}")]
    Write(String),
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

/// Write-side storage contract for produced images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `data` under `key` and return the public URL.
    async fn put(&self, key: &str, data: Bytes, content_type: &str)
        -> Result<String, BlobError>;
}

/// Reject keys that could escape the store's root.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty() || key.starts_with('/') || key.contains("..") {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}
