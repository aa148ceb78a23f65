// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path layout and identifier rules for the data directory.
//!
//! ## Layout
//!
//! ```text
//! /data/
//!   blobs/{user_id}/{file_id}/{blob_id}   # ciphertext objects
//!   metadata/files.redb                   # file metadata records
//! ```
//!
//! A storage path is the `{user_id}/{file_id}/{blob_id}` triple. The blob id
//! is freshly generated for every upload, so a replacement never overwrites
//! the object a live record still points to.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Base directory for all persistent storage.
pub const DATA_ROOT: &str = "/data";

/// Maximum length of a user or file identifier.
pub const MAX_SEGMENT_LEN: usize = 128;

/// Suffix used for objects that are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// An identifier that cannot be used as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} {reason}")]
pub struct InvalidSegment {
    pub field: &'static str,
    pub reason: &'static str,
}

/// Check that `value` is a safe, non-empty path segment.
///
/// Allowed characters are ASCII alphanumerics plus `.`, `_` and `-`.
/// `.` and `..` are rejected.
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), InvalidSegment> {
    let fail = |reason| Err(InvalidSegment { field, reason });

    if value.is_empty() {
        return fail("cannot be empty");
    }
    if value.len() > MAX_SEGMENT_LEN {
        return fail("is too long");
    }
    if value == "." || value == ".." {
        return fail("cannot be a relative path component");
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return fail("contains unsupported characters");
    }
    Ok(())
}

/// Generate a fresh storage path for an upload.
pub fn new_storage_path(owner_id: &str, content_id: &str) -> Result<String, InvalidSegment> {
    validate_segment("owner_id", owner_id)?;
    validate_segment("content_id", content_id)?;
    Ok(format!(
        "{owner_id}/{content_id}/{}",
        Uuid::new_v4().as_simple()
    ))
}

/// Split a storage path into its three validated segments.
pub fn split_storage_path(storage_path: &str) -> Result<[&str; 3], InvalidSegment> {
    let mut parts = storage_path.split('/');
    let (Some(owner), Some(content), Some(blob), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(InvalidSegment {
            field: "storage_path",
            reason: "must have exactly three segments",
        });
    };

    validate_segment("owner_id", owner)?;
    validate_segment("content_id", content)?;
    validate_segment("blob_id", blob)?;
    if blob.ends_with(PARTIAL_SUFFIX) {
        return Err(InvalidSegment {
            field: "blob_id",
            reason: "refers to an incomplete object",
        });
    }
    Ok([owner, content, blob])
}

/// Storage path utilities for the data directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory containing all ciphertext blobs.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Filesystem location of a blob. The storage path must already be validated.
    pub fn blob(&self, segments: [&str; 3]) -> PathBuf {
        let [owner, content, blob] = segments;
        self.blobs_dir().join(owner).join(content).join(blob)
    }

    /// Directory for the metadata database.
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// Path to the file metadata database.
    pub fn metadata_db(&self) -> PathBuf {
        self.metadata_dir().join("files.redb")
    }
}
