// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Metadata Store abstraction: where [`EncryptedFile`] records live.

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use super::file_database::FileDbError;
use crate::models::EncryptedFile;

#[derive(Debug, thiserror::Error)]
pub enum MetadataStoreError {
    /// `(user_id, file_id)` is already taken by another record.
    #[error("file {file_id} already exists for user {user_id}")]
    Duplicate { user_id: String, file_id: String },

    /// A record with this id already exists.
    #[error("file record {0} already exists")]
    DuplicateId(Uuid),

    /// No record with this id.
    #[error("metadata record not found: {0}")]
    Missing(Uuid),

    #[error("metadata database error: {0}")]
    Database(FileDbError),

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("metadata task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Adapter over a document store holding one record per file.
///
/// Implementations keep a unique index on `(user_id, file_id)` and an index
/// on `(user_id, created_at desc)`, and must be safe for concurrent use.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a new record. Fails with `DuplicateId` if `file.id` is taken and
    /// with `Duplicate` if `(user_id, file_id)` is taken. Never overwrites.
    async fn insert(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptedFile>, MetadataStoreError>;

    async fn find_by_file_id(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<EncryptedFile>, MetadataStoreError>;

    /// Overwrite the record with `file.id`. Fails with `Missing` if it is gone
    /// and with `Duplicate` if the new `(user_id, file_id)` belongs to another record.
    async fn replace(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError>;

    /// Remove a record. Fails with `Missing` if it is already gone.
    async fn delete(&self, id: Uuid) -> Result<(), MetadataStoreError>;

    /// All records of a user, newest `created_at` first, ties by id ascending.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<EncryptedFile>, MetadataStoreError>;

    /// Every storage path referenced by a record.
    async fn storage_paths(&self) -> Result<HashSet<String>, MetadataStoreError>;

    async fn health_check(&self) -> Result<(), MetadataStoreError>;
}
