// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded file metadata database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `files`: record id → serialized EncryptedFile
//! - `file_keys`: unique key (user_id|file_id) → record id
//! - `user_timeline`: composite key (user_id|!created_at|id) → record id
//!
//! `|` is a NUL byte. Identifiers are validated path segments, so they never
//! contain one. Every mutation touches all three tables inside a single write
//! transaction.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::metadata::{MetadataStore, MetadataStoreError};
use crate::models::EncryptedFile;

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary table: record id → serialized EncryptedFile (JSON bytes).
const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Unique index: `user_id|file_id` → record id.
const FILE_KEYS: TableDefinition<&[u8], &str> = TableDefinition::new("file_keys");

/// Timeline index: `user_id|!created_at_be|id` → record id, for newest-first scans.
const USER_TIMELINE: TableDefinition<&[u8], &str> = TableDefinition::new("user_timeline");

const SEP: u8 = 0x00;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FileDbError {
    #[error("file {file_id} already exists for user {user_id}")]
    Duplicate { user_id: String, file_id: String },

    #[error("record id already exists: {0}")]
    DuplicateId(Uuid),

    #[error("record not found: {0}")]
    Missing(Uuid),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FileDbResult<T> = Result<T, FileDbError>;

impl From<FileDbError> for MetadataStoreError {
    fn from(err: FileDbError) -> Self {
        match err {
            FileDbError::Duplicate { user_id, file_id } => {
                MetadataStoreError::Duplicate { user_id, file_id }
            }
            FileDbError::DuplicateId(id) => MetadataStoreError::DuplicateId(id),
            FileDbError::Missing(id) => MetadataStoreError::Missing(id),
            other => MetadataStoreError::Database(other),
        }
    }
}

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Unique key: `user_id | file_id`.
fn make_file_key(user_id: &str, file_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 1 + file_id.len());
    key.extend_from_slice(user_id.as_bytes());
    key.push(SEP);
    key.extend_from_slice(file_id.as_bytes());
    key
}

/// Timeline key: `user_id | inverted seconds | inverted nanos | id`.
///
/// Seconds are mapped to an order-preserving unsigned value before
/// inversion, so a forward scan yields newest first. The id suffix orders
/// equal timestamps ascending.
fn make_timeline_key(user_id: &str, created_at: DateTime<Utc>, id: Uuid) -> Vec<u8> {
    let secs = (created_at.timestamp() as u64) ^ (1 << 63);
    let nanos = created_at.timestamp_subsec_nanos();
    let id = id.hyphenated().to_string();

    let mut key = Vec::with_capacity(user_id.len() + 1 + 8 + 4 + 1 + id.len());
    key.extend_from_slice(user_id.as_bytes());
    key.push(SEP);
    key.extend_from_slice(&(!secs).to_be_bytes());
    key.extend_from_slice(&(!nanos).to_be_bytes());
    key.push(SEP);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Range bounds covering every timeline key of a user.
fn make_user_range(user_id: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(user_id.len() + 1);
    start.extend_from_slice(user_id.as_bytes());
    let mut end = start.clone();
    start.push(SEP);
    end.push(SEP + 1);
    (start, end)
}

// =============================================================================
// FileDatabase
// =============================================================================

/// Embedded ACID metadata database.
#[derive(Clone)]
pub struct FileDatabase {
    db: Arc<Database>,
}

impl FileDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> FileDbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(FILES)?;
            let _ = write_txn.open_table(FILE_KEYS)?;
            let _ = write_txn.open_table(USER_TIMELINE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new record with its index entries.
    pub fn insert_record(&self, file: &EncryptedFile) -> FileDbResult<()> {
        let json = serde_json::to_vec(file)?;
        let id = file.id.hyphenated().to_string();
        let file_key = make_file_key(&file.user_id, &file.file_id);

        let write_txn = self.db.begin_write()?;
        {
            let mut files = write_txn.open_table(FILES)?;
            if files.get(id.as_str())?.is_some() {
                return Err(FileDbError::DuplicateId(file.id));
            }

            let mut keys = write_txn.open_table(FILE_KEYS)?;
            if keys.get(file_key.as_slice())?.is_some() {
                return Err(FileDbError::Duplicate {
                    user_id: file.user_id.clone(),
                    file_id: file.file_id.clone(),
                });
            }
            keys.insert(file_key.as_slice(), id.as_str())?;
            files.insert(id.as_str(), json.as_slice())?;

            let mut timeline = write_txn.open_table(USER_TIMELINE)?;
            let key = make_timeline_key(&file.user_id, file.created_at, file.id);
            timeline.insert(key.as_slice(), id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a single record by id.
    pub fn get_record(&self, id: Uuid) -> FileDbResult<Option<EncryptedFile>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILES)?;
        match table.get(id.hyphenated().to_string().as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Look up a record through the unique `(user_id, file_id)` index.
    pub fn get_record_by_file_id(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> FileDbResult<Option<EncryptedFile>> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(FILE_KEYS)?;
        let files = read_txn.open_table(FILES)?;

        let Some(id) = keys.get(make_file_key(user_id, file_id).as_slice())? else {
            return Ok(None);
        };
        match files.get(id.value())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Overwrite a record and move its index entries if the keys changed.
    pub fn replace_record(&self, file: &EncryptedFile) -> FileDbResult<()> {
        let json = serde_json::to_vec(file)?;
        let id = file.id.hyphenated().to_string();

        let write_txn = self.db.begin_write()?;
        {
            let mut files = write_txn.open_table(FILES)?;
            let mut keys = write_txn.open_table(FILE_KEYS)?;
            let mut timeline = write_txn.open_table(USER_TIMELINE)?;

            // Read existing value and deserialize before mutating
            let existing_bytes = {
                let existing = files
                    .get(id.as_str())?
                    .ok_or(FileDbError::Missing(file.id))?;
                existing.value().to_vec()
            };
            let existing: EncryptedFile = serde_json::from_slice(&existing_bytes)?;

            let old_key = make_file_key(&existing.user_id, &existing.file_id);
            let new_key = make_file_key(&file.user_id, &file.file_id);
            if old_key != new_key {
                let taken = keys
                    .get(new_key.as_slice())?
                    .is_some_and(|owner| owner.value() != id);
                if taken {
                    return Err(FileDbError::Duplicate {
                        user_id: file.user_id.clone(),
                        file_id: file.file_id.clone(),
                    });
                }
                keys.remove(old_key.as_slice())?;
            }
            keys.insert(new_key.as_slice(), id.as_str())?;

            timeline.remove(
                make_timeline_key(&existing.user_id, existing.created_at, existing.id).as_slice(),
            )?;
            timeline.insert(
                make_timeline_key(&file.user_id, file.created_at, file.id).as_slice(),
                id.as_str(),
            )?;

            files.insert(id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a record and its index entries.
    pub fn delete_record(&self, id: Uuid) -> FileDbResult<()> {
        let id_str = id.hyphenated().to_string();

        let write_txn = self.db.begin_write()?;
        {
            let mut files = write_txn.open_table(FILES)?;
            let existing_bytes = {
                let existing = files
                    .remove(id_str.as_str())?
                    .ok_or(FileDbError::Missing(id))?;
                existing.value().to_vec()
            };
            let existing: EncryptedFile = serde_json::from_slice(&existing_bytes)?;

            let mut keys = write_txn.open_table(FILE_KEYS)?;
            keys.remove(make_file_key(&existing.user_id, &existing.file_id).as_slice())?;

            let mut timeline = write_txn.open_table(USER_TIMELINE)?;
            timeline.remove(
                make_timeline_key(&existing.user_id, existing.created_at, existing.id).as_slice(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All records of a user, newest first.
    pub fn list_records_by_user(&self, user_id: &str) -> FileDbResult<Vec<EncryptedFile>> {
        let read_txn = self.db.begin_read()?;
        let timeline = read_txn.open_table(USER_TIMELINE)?;
        let files = read_txn.open_table(FILES)?;

        let (start, end) = make_user_range(user_id);
        let mut results = Vec::new();
        for entry in timeline.range(start.as_slice()..end.as_slice())? {
            let entry = entry?;
            if let Some(value) = files.get(entry.1.value())? {
                results.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(results)
    }

    /// Every storage path referenced by a record.
    pub fn referenced_paths(&self) -> FileDbResult<HashSet<String>> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;

        let mut paths = HashSet::new();
        for entry in files.iter()? {
            let entry = entry?;
            let file: EncryptedFile = serde_json::from_slice(entry.1.value())?;
            paths.insert(file.storage_path);
        }
        Ok(paths)
    }

    /// Open a read transaction on every table.
    pub fn probe(&self) -> FileDbResult<()> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;
        let _ = files.first()?;
        read_txn.open_table(FILE_KEYS)?;
        read_txn.open_table(USER_TIMELINE)?;
        Ok(())
    }

    /// Number of stored records.
    pub fn count(&self) -> FileDbResult<u64> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;
        let mut count = 0;
        for entry in files.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

// =============================================================================
// MetadataStore
// =============================================================================

impl FileDatabase {
    async fn blocking<T, F>(&self, op: F) -> Result<T, MetadataStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&FileDatabase) -> FileDbResult<T> + Send + 'static,
    {
        let db = self.clone();
        Ok(tokio::task::spawn_blocking(move || op(&db)).await??)
    }
}

#[async_trait]
impl MetadataStore for FileDatabase {
    async fn insert(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError> {
        let file = file.clone();
        self.blocking(move |db| db.insert_record(&file)).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptedFile>, MetadataStoreError> {
        self.blocking(move |db| db.get_record(id)).await
    }

    async fn find_by_file_id(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<EncryptedFile>, MetadataStoreError> {
        let (user_id, file_id) = (user_id.to_string(), file_id.to_string());
        self.blocking(move |db| db.get_record_by_file_id(&user_id, &file_id))
            .await
    }

    async fn replace(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError> {
        let file = file.clone();
        self.blocking(move |db| db.replace_record(&file)).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), MetadataStoreError> {
        self.blocking(move |db| db.delete_record(id)).await
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<EncryptedFile>, MetadataStoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.list_records_by_user(&user_id))
            .await
    }

    async fn storage_paths(&self) -> Result<HashSet<String>, MetadataStoreError> {
        self.blocking(|db| db.referenced_paths()).await
    }

    async fn health_check(&self) -> Result<(), MetadataStoreError> {
        self.blocking(|db| db.probe()).await
    }
}
