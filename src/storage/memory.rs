// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory content and metadata stores.
//!
//! Used for the `memory` backend and throughout the tests. Each store can be
//! told to fail specific operations so consistency paths can be exercised.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::content::{ContentReader, ContentStore, ContentStoreError, ObjectInfo, StoredObject};
use super::metadata::{MetadataStore, MetadataStoreError};
use super::paths::{new_storage_path, split_storage_path};
use super::presign::UrlSigner;
use crate::models::{EncryptedFile, PresignedUrl};

fn injected() -> String {
    "injected failure".to_string()
}

// =============================================================================
// Content
// =============================================================================

struct Object {
    bytes: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// Blob store holding objects in a map.
pub struct MemoryContentStore {
    objects: RwLock<HashMap<String, Object>>,
    signer: UrlSigner,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryContentStore {
    pub fn new(signer: UrlSigner) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            signer,
            fail_uploads: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Whether an object exists at `storage_path`.
    pub async fn contains(&self, storage_path: &str) -> bool {
        self.objects.read().await.contains_key(storage_path)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Place an object directly, bypassing path generation.
    pub async fn put_raw(&self, storage_path: &str, bytes: Vec<u8>, last_modified: DateTime<Utc>) {
        self.objects.write().await.insert(
            storage_path.to_string(),
            Object {
                bytes,
                last_modified,
            },
        );
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn upload_file(
        &self,
        owner_id: &str,
        content_id: &str,
        mut content: ContentReader,
    ) -> Result<StoredObject, ContentStoreError> {
        let storage_path = new_storage_path(owner_id, content_id)?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ContentStoreError::Backend(injected()));
        }

        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).await?;
        let size = bytes.len() as u64;

        self.put_raw(&storage_path, bytes, Utc::now()).await;
        Ok(StoredObject { storage_path, size })
    }

    async fn download_file(&self, storage_path: &str) -> Result<ContentReader, ContentStoreError> {
        let objects = self.objects.read().await;
        let object = objects
            .get(storage_path)
            .ok_or_else(|| ContentStoreError::NotFound(storage_path.to_string()))?;
        Ok(Box::new(Cursor::new(object.bytes.clone())))
    }

    async fn delete_file(&self, storage_path: &str) -> Result<(), ContentStoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ContentStoreError::Backend(injected()));
        }
        self.objects.write().await.remove(storage_path);
        Ok(())
    }

    async fn get_download_url(
        &self,
        storage_path: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ContentStoreError> {
        split_storage_path(storage_path)?;
        if !self.contains(storage_path).await {
            return Err(ContentStoreError::NotFound(storage_path.to_string()));
        }
        self.signer.sign(storage_path, ttl, Utc::now())
    }

    async fn list_objects(&self) -> Result<Vec<ObjectInfo>, ContentStoreError> {
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .map(|(path, object)| ObjectInfo {
                storage_path: path.clone(),
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), ContentStoreError> {
        Ok(())
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Record store holding documents in a map, with the same uniqueness and
/// ordering rules as the redb store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: RwLock<HashMap<Uuid, EncryptedFile>>,
    fail_inserts: AtomicBool,
    fail_replaces: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_replaces(&self, fail: bool) {
        self.fail_replaces.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn key_taken(
    records: &HashMap<Uuid, EncryptedFile>,
    file: &EncryptedFile,
) -> Result<(), MetadataStoreError> {
    let taken = records
        .values()
        .any(|r| r.id != file.id && r.user_id == file.user_id && r.file_id == file.file_id);
    if taken {
        return Err(MetadataStoreError::Duplicate {
            user_id: file.user_id.clone(),
            file_id: file.file_id.clone(),
        });
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(MetadataStoreError::Unavailable(injected()));
        }
        let mut records = self.records.write().await;
        if records.contains_key(&file.id) {
            return Err(MetadataStoreError::DuplicateId(file.id));
        }
        key_taken(&records, file)?;
        records.insert(file.id, file.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptedFile>, MetadataStoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_file_id(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<EncryptedFile>, MetadataStoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.user_id == user_id && r.file_id == file_id)
            .cloned())
    }

    async fn replace(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError> {
        if self.fail_replaces.load(Ordering::SeqCst) {
            return Err(MetadataStoreError::Unavailable(injected()));
        }
        let mut records = self.records.write().await;
        if !records.contains_key(&file.id) {
            return Err(MetadataStoreError::Missing(file.id));
        }
        key_taken(&records, file)?;
        records.insert(file.id, file.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), MetadataStoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(MetadataStoreError::Unavailable(injected()));
        }
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(MetadataStoreError::Missing(id))
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<EncryptedFile>, MetadataStoreError> {
        let mut files: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn storage_paths(&self) -> Result<HashSet<String>, MetadataStoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .map(|r| r.storage_path.clone())
            .collect())
    }

    async fn health_check(&self) -> Result<(), MetadataStoreError> {
        Ok(())
    }
}
