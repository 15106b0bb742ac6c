//! Local-filesystem blob store.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{validate_key, BlobError, BlobStore};

/// Writes blobs under a root directory and serves them from a configured
/// base URL (typically a static file server fronting the same directory).
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, BlobError> {
        validate_key(key)?;

        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Write(e.to_string()))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| BlobError::Write(e.to_string()))?;

        debug!(key, content_type, bytes = data.len(), "stored blob");
        Ok(format!("{}/{key}", self.base_url))
    }
}
