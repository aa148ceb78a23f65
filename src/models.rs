// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # File Data Models
//!
//! Records describing encrypted files. Every client-supplied field is opaque:
//! the server stores and returns it verbatim and never interprets it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::keys::EncryptedFileKey;

// =============================================================================
// Encrypted File
// =============================================================================

/// Metadata record of one stored encrypted file.
///
/// `(user_id, file_id)` is unique across all records. `storage_path` names a
/// blob that exists in the content store for as long as the record does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFile {
    /// Server-assigned record identifier.
    pub id: Uuid,
    /// Owner of the file.
    pub user_id: String,
    /// Client-chosen identifier, unique per user.
    pub file_id: String,
    /// Blob location in the content store.
    pub storage_path: String,
    /// Ciphertext size in bytes, as measured during upload.
    pub encrypted_size: u64,
    /// Client-encrypted name, MIME type and similar.
    pub encrypted_metadata: String,
    /// Client-computed hash of the plaintext, encrypted.
    pub encrypted_hash: String,
    /// Client-side scheme version tag.
    pub encryption_version: String,
    /// File key wrapped under its collection key, when the client supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_file_key: Option<EncryptedFileKey>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

// =============================================================================
// Draft
// =============================================================================

/// Caller-supplied fields for a create or update.
///
/// On create, `id` is used when set (and must not belong to an existing
/// record) or assigned otherwise. On update it is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDraft {
    pub id: Option<Uuid>,
    pub user_id: String,
    pub file_id: String,
    pub encrypted_metadata: String,
    pub encrypted_hash: String,
    pub encryption_version: String,
    pub encrypted_file_key: Option<EncryptedFileKey>,
}

impl FileDraft {
    pub fn new(user_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            file_id: file_id.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_encrypted_metadata(mut self, value: impl Into<String>) -> Self {
        self.encrypted_metadata = value.into();
        self
    }

    pub fn with_encrypted_hash(mut self, value: impl Into<String>) -> Self {
        self.encrypted_hash = value.into();
        self
    }

    pub fn with_encryption_version(mut self, value: impl Into<String>) -> Self {
        self.encryption_version = value.into();
        self
    }

    pub fn with_encrypted_file_key(mut self, key: EncryptedFileKey) -> Self {
        self.encrypted_file_key = Some(key);
        self
    }
}

impl From<&EncryptedFile> for FileDraft {
    fn from(file: &EncryptedFile) -> Self {
        Self {
            id: Some(file.id),
            user_id: file.user_id.clone(),
            file_id: file.file_id.clone(),
            encrypted_metadata: file.encrypted_metadata.clone(),
            encrypted_hash: file.encrypted_hash.clone(),
            encryption_version: file.encryption_version.clone(),
            encrypted_file_key: file.encrypted_file_key.clone(),
        }
    }
}

// =============================================================================
// Presigned URL
// =============================================================================

/// Time-limited link granting direct read access to one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: Url,
    pub expires_at: DateTime<Utc>,
}
