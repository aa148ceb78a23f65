// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Content Store abstraction: where ciphertext blobs live.
//!
//! Blobs are addressed by an opaque storage path that the store itself
//! generates on upload. Contents are never inspected.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use crate::models::PresignedUrl;
use crate::storage::paths::InvalidSegment;

/// Streaming source of blob bytes.
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub storage_path: String,
    /// Bytes actually written.
    pub size: u64,
}

/// A blob as seen by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub storage_path: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid storage path: {0}")]
    InvalidPath(#[from] InvalidSegment),

    #[error("invalid link lifetime: {0:?}")]
    InvalidTtl(Duration),

    #[error("content store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("content store backend error: {0}")]
    Backend(String),
}

impl ContentStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentStoreError::NotFound(_))
    }
}

/// Adapter over a blob backend.
///
/// Implementations must be safe for concurrent use. `delete_file` is
/// idempotent: deleting a missing object succeeds.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Stream `content` into a new object under a freshly generated path.
    async fn upload_file(
        &self,
        owner_id: &str,
        content_id: &str,
        content: ContentReader,
    ) -> Result<StoredObject, ContentStoreError>;

    /// Open a stream over the object's bytes.
    async fn download_file(&self, storage_path: &str) -> Result<ContentReader, ContentStoreError>;

    async fn delete_file(&self, storage_path: &str) -> Result<(), ContentStoreError>;

    /// Produce a time-limited link granting direct read access.
    async fn get_download_url(
        &self,
        storage_path: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ContentStoreError>;

    /// Enumerate every complete object. Used by the orphan sweep.
    async fn list_objects(&self) -> Result<Vec<ObjectInfo>, ContentStoreError>;

    async fn health_check(&self) -> Result<(), ContentStoreError>;
}
