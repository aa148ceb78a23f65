// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encrypted file repository.
//!
//! Coordinates a [`ContentStore`] holding ciphertext blobs and a
//! [`MetadataStore`] holding the records that point at them. There is no
//! transaction spanning both stores, so every mutation is ordered to keep
//! one invariant: a visible record always points at a blob that exists.
//!
//! ## Ordering
//!
//! - **create**: upload the blob, then insert the record. If the insert
//!   fails, the blob is deleted again.
//! - **update**: upload the replacement blob (if any), replace the record,
//!   then delete the old blob. If the replace fails, the new blob is deleted.
//! - **delete**: remove the record, then delete the blob.
//!
//! Blob deletes that follow a committed metadata change are best effort and
//! only logged. A compensating delete that fails leaves an orphan blob; it is
//! logged at `error` with the record id and storage path and never replaces
//! the error returned to the caller.
//!
//! ## Cancellation
//!
//! Every operation takes a [`CancellationToken`]. Store reads and uploads race
//! the token and the per-call timeout. Metadata mutations are commit points:
//! the token is checked before they start and they are never abandoned
//! midway, so the returned result always matches what was persisted.
//!
//! ## Known gaps
//!
//! Concurrent creates of the same `(user_id, file_id)` both upload; the
//! metadata uniqueness index picks the winner and the loser's blob is
//! compensated (or orphaned if that delete fails).
//!
//! Updates are fetch-then-replace with no version check, so concurrent
//! updates of one record are last-writer-wins and the overwritten writer's
//! new blob is left unreferenced until an orphan sweep removes it. Worse, a
//! writer that fetched the record before a content update committed carries
//! the old storage path forward. If it replaces last, the record points at
//! the blob the content update already deleted, and downloads fail with
//! `NotFound` until the record is updated again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{EncryptedFile, FileDraft, PresignedUrl};
use crate::storage::content::{ContentReader, ContentStore, ContentStoreError};
use crate::storage::metadata::{MetadataStore, MetadataStoreError};
use crate::storage::paths::{validate_segment, InvalidSegment};

/// Default per-call timeout for store reads and uploads.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on direct-access link lifetime.
pub const DEFAULT_MAX_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FileRepositoryError {
    #[error("file not found: {0}")]
    NotFound(Uuid),

    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("content store error: {0}")]
    Storage(#[from] ContentStoreError),

    #[error("metadata store error: {0}")]
    Metadata(#[from] MetadataStoreError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("store call timed out after {0:?}")]
    TimedOut(Duration),
}

impl FileRepositoryError {
    /// Whether the failure came from a uniqueness constraint: the record id or
    /// the `(user_id, file_id)` index.
    pub fn is_uniqueness_violation(&self) -> bool {
        matches!(
            self,
            FileRepositoryError::Metadata(
                MetadataStoreError::Duplicate { .. } | MetadataStoreError::DuplicateId(_)
            )
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FileRepositoryError::NotFound(_))
    }

    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        FileRepositoryError::Validation {
            field,
            message: message.into(),
        }
    }
}

impl From<InvalidSegment> for FileRepositoryError {
    fn from(err: InvalidSegment) -> Self {
        FileRepositoryError::validation(err.field, err.reason)
    }
}

pub type FileRepositoryResult<T> = Result<T, FileRepositoryError>;

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Limit on each store read or upload. `None` disables it.
    pub call_timeout: Option<Duration>,
    /// Longest lifetime a direct-access link may be issued with.
    pub max_url_ttl: Duration,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            max_url_ttl: DEFAULT_MAX_URL_TTL,
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// The only component that talks to both stores.
#[derive(Clone)]
pub struct EncryptedFileRepository {
    content: Arc<dyn ContentStore>,
    metadata: Arc<dyn MetadataStore>,
    options: RepositoryOptions,
}

impl EncryptedFileRepository {
    pub fn new(content: Arc<dyn ContentStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self::with_options(content, metadata, RepositoryOptions::default())
    }

    pub fn with_options(
        content: Arc<dyn ContentStore>,
        metadata: Arc<dyn MetadataStore>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            content,
            metadata,
            options,
        }
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    // =========================================================================
    // Store call helpers
    // =========================================================================

    /// Run an abandonable store call against the token and the call timeout.
    async fn guard<T, E, F>(&self, cancel: &CancellationToken, call: F) -> FileRepositoryResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<FileRepositoryError>,
    {
        if cancel.is_cancelled() {
            return Err(FileRepositoryError::Cancelled);
        }
        let limit = self.options.call_timeout;
        let timed = async move {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(_) => Err(FileRepositoryError::TimedOut(limit)),
                },
                None => call.await.map_err(Into::into),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FileRepositoryError::Cancelled),
            result = timed => result,
        }
    }

    /// Run a metadata mutation to completion unless cancelled beforehand.
    async fn commit<F>(&self, cancel: &CancellationToken, mutation: F) -> FileRepositoryResult<()>
    where
        F: Future<Output = Result<(), MetadataStoreError>>,
    {
        if cancel.is_cancelled() {
            return Err(FileRepositoryError::Cancelled);
        }
        mutation.await.map_err(|err| match err {
            MetadataStoreError::Missing(id) => FileRepositoryError::NotFound(id),
            other => FileRepositoryError::Metadata(other),
        })
    }

    /// Delete a blob that no committed record references.
    ///
    /// Runs regardless of cancellation. Failure leaves an orphan and is
    /// reported only through the log.
    async fn compensate(&self, record_id: Uuid, storage_path: &str, operation: &'static str) {
        let attempt = self.content.delete_file(storage_path);
        let result = match self.options.call_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or_else(|_| Err(ContentStoreError::Backend("timed out".to_string()))),
            None => attempt.await,
        };

        match result {
            Ok(()) => tracing::debug!(
                record_id = %record_id,
                storage_path = %storage_path,
                operation,
                "Compensated uploaded blob"
            ),
            Err(e) => tracing::error!(
                record_id = %record_id,
                storage_path = %storage_path,
                operation,
                error = %e,
                "Compensating delete failed, blob is orphaned"
            ),
        }
    }

    /// Delete a blob after its record has moved on. Failure is only logged.
    async fn cleanup(&self, record_id: Uuid, storage_path: &str, operation: &'static str) {
        if let Err(e) = self.content.delete_file(storage_path).await {
            tracing::warn!(
                record_id = %record_id,
                storage_path = %storage_path,
                operation,
                error = %e,
                "Failed to delete superseded blob"
            );
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Upload `content` and insert a record for it.
    ///
    /// Uses `draft.id` when present, otherwise assigns a fresh id. The
    /// record only becomes visible after its blob is durably written.
    pub async fn create(
        &self,
        draft: FileDraft,
        content: ContentReader,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<EncryptedFile> {
        validate_ids(&draft)?;

        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();

        let stored = self
            .guard(
                cancel,
                self.content
                    .upload_file(&draft.user_id, &draft.file_id, content),
            )
            .await?;

        let file = EncryptedFile {
            id,
            user_id: draft.user_id,
            file_id: draft.file_id,
            storage_path: stored.storage_path,
            encrypted_size: stored.size,
            encrypted_metadata: draft.encrypted_metadata,
            encrypted_hash: draft.encrypted_hash,
            encryption_version: draft.encryption_version,
            encrypted_file_key: draft.encrypted_file_key,
            created_at: now,
            modified_at: now,
        };

        if let Err(err) = self.commit(cancel, self.metadata.insert(&file)).await {
            self.compensate(file.id, &file.storage_path, "create").await;
            return Err(err);
        }

        tracing::debug!(
            record_id = %file.id,
            user_id = %file.user_id,
            file_id = %file.file_id,
            size = file.encrypted_size,
            "File created"
        );
        Ok(file)
    }

    /// Point lookup by record id. Absent records are `Ok(None)`.
    pub async fn get_by_id(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<Option<EncryptedFile>> {
        self.guard(cancel, self.metadata.find_by_id(id)).await
    }

    /// Point lookup by the caller's `(user_id, file_id)`. Absent records are `Ok(None)`.
    pub async fn get_by_file_id(
        &self,
        user_id: &str,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<Option<EncryptedFile>> {
        validate_segment("user_id", user_id)?;
        validate_segment("file_id", file_id)?;
        self.guard(cancel, self.metadata.find_by_file_id(user_id, file_id))
            .await
    }

    /// Replace the record `draft.id` wholesale.
    ///
    /// `created_at` is carried over. Without new content the blob, its path
    /// and its size are carried over too; with new content a new blob is
    /// uploaded and the old one deleted after the record is replaced.
    pub async fn update_by_id(
        &self,
        draft: FileDraft,
        content: Option<ContentReader>,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<EncryptedFile> {
        let id = draft
            .id
            .ok_or_else(|| FileRepositoryError::validation("id", "is required for update"))?;
        validate_ids(&draft)?;

        let existing = self
            .guard(cancel, self.metadata.find_by_id(id))
            .await?
            .ok_or(FileRepositoryError::NotFound(id))?;

        let (storage_path, encrypted_size, uploaded) = match content {
            Some(content) => {
                let stored = self
                    .guard(
                        cancel,
                        self.content
                            .upload_file(&draft.user_id, &draft.file_id, content),
                    )
                    .await?;
                (stored.storage_path, stored.size, true)
            }
            None => (existing.storage_path.clone(), existing.encrypted_size, false),
        };

        let file = EncryptedFile {
            id,
            user_id: draft.user_id,
            file_id: draft.file_id,
            storage_path,
            encrypted_size,
            encrypted_metadata: draft.encrypted_metadata,
            encrypted_hash: draft.encrypted_hash,
            encryption_version: draft.encryption_version,
            encrypted_file_key: draft.encrypted_file_key,
            created_at: existing.created_at,
            modified_at: next_modified_at(existing.modified_at, Utc::now()),
        };

        if let Err(err) = self.commit(cancel, self.metadata.replace(&file)).await {
            if uploaded {
                self.compensate(file.id, &file.storage_path, "update").await;
            }
            return Err(err);
        }

        if uploaded && existing.storage_path != file.storage_path {
            self.cleanup(file.id, &existing.storage_path, "update").await;
        }

        tracing::debug!(
            record_id = %file.id,
            replaced_content = uploaded,
            size = file.encrypted_size,
            "File updated"
        );
        Ok(file)
    }

    /// Remove the record, then its blob.
    ///
    /// Succeeds once the record is gone even if the blob delete fails.
    pub async fn delete_by_id(&self, id: Uuid, cancel: &CancellationToken) -> FileRepositoryResult<()> {
        let existing = self
            .guard(cancel, self.metadata.find_by_id(id))
            .await?
            .ok_or(FileRepositoryError::NotFound(id))?;

        self.commit(cancel, self.metadata.delete(id)).await?;
        self.cleanup(id, &existing.storage_path, "delete").await;

        tracing::debug!(record_id = %id, "File deleted");
        Ok(())
    }

    /// All records of a user, newest first.
    pub async fn list_by_user_id(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<Vec<EncryptedFile>> {
        validate_segment("user_id", user_id)?;
        self.guard(cancel, self.metadata.list_by_user(user_id)).await
    }

    /// Open a stream over the record's current blob.
    pub async fn download_content(
        &self,
        file: &EncryptedFile,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<ContentReader> {
        self.guard(cancel, self.content.download_file(&file.storage_path))
            .await
    }

    /// Issue a direct-access link to the record's current blob.
    ///
    /// The link expires `ttl` after issuance. `ttl` must be positive and at
    /// most the configured maximum.
    pub async fn get_download_url(
        &self,
        file: &EncryptedFile,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> FileRepositoryResult<PresignedUrl> {
        if ttl.is_zero() {
            return Err(FileRepositoryError::validation("ttl", "must be positive"));
        }
        if ttl > self.options.max_url_ttl {
            return Err(FileRepositoryError::validation(
                "ttl",
                format!("exceeds maximum of {}s", self.options.max_url_ttl.as_secs()),
            ));
        }
        self.guard(cancel, self.content.get_download_url(&file.storage_path, ttl))
            .await
    }

    /// Check both stores.
    pub async fn health_check(&self, cancel: &CancellationToken) -> FileRepositoryResult<()> {
        self.content_health(cancel).await?;
        self.metadata_health(cancel).await
    }

    pub async fn content_health(&self, cancel: &CancellationToken) -> FileRepositoryResult<()> {
        self.guard(cancel, self.content.health_check()).await
    }

    pub async fn metadata_health(&self, cancel: &CancellationToken) -> FileRepositoryResult<()> {
        self.guard(cancel, self.metadata.health_check()).await
    }
}

fn validate_ids(draft: &FileDraft) -> Result<(), InvalidSegment> {
    validate_segment("user_id", &draft.user_id)?;
    validate_segment("file_id", &draft.file_id)
}

/// `now`, unless the clock has not passed `previous`.
fn next_modified_at(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + TimeDelta::nanoseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EncryptedFileKey;
    use crate::storage::blob_fs::FsContentStore;
    use crate::storage::file_database::FileDatabase;
    use crate::storage::memory::{MemoryContentStore, MemoryMetadataStore};
    use crate::storage::paths::StoragePaths;
    use crate::storage::presign::{DirectAccess, UrlSigner};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::sync::{oneshot, Mutex};
    use url::Url;

    struct Fixture {
        repo: EncryptedFileRepository,
        content: Arc<MemoryContentStore>,
        metadata: Arc<MemoryMetadataStore>,
    }

    fn signer() -> UrlSigner {
        UrlSigner::new(&[11u8; 32], Url::parse("http://127.0.0.1:8080/").unwrap()).unwrap()
    }

    fn fixture_with(options: RepositoryOptions) -> Fixture {
        let content = Arc::new(MemoryContentStore::new(signer()));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let repo = EncryptedFileRepository::with_options(content.clone(), metadata.clone(), options);
        Fixture {
            repo,
            content,
            metadata,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RepositoryOptions::default())
    }

    fn bytes(data: &[u8]) -> ContentReader {
        Box::new(Cursor::new(data.to_vec()))
    }

    fn draft(user_id: &str, file_id: &str) -> FileDraft {
        FileDraft::new(user_id, file_id)
            .with_encrypted_metadata("enc-meta")
            .with_encrypted_hash("enc-hash")
            .with_encryption_version("v1")
    }

    async fn read_all(mut reader: ContentReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    /// Never yields any bytes.
    struct Stalled;

    impl AsyncRead for Stalled {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    /// Cancels a token once the caller has consumed every byte.
    struct CancelAtEof {
        inner: Cursor<Vec<u8>>,
        token: CancellationToken,
    }

    impl AsyncRead for CancelAtEof {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let before = buf.filled().len();
            let this = &mut *self;
            let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
            if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() == before {
                this.token.cancel();
            }
            poll
        }
    }

    // =========================================================================
    // create
    // =========================================================================

    #[tokio::test]
    async fn create_then_get_resolves_same_bytes() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = EncryptedFileKey::new(vec![1; 40], vec![2; 24]).unwrap();

        let created = f
            .repo
            .create(draft("u1", "f1").with_encrypted_file_key(key.clone()), bytes(b"ciphertext"), &cancel)
            .await
            .unwrap();
        assert_eq!(created.encrypted_size, 10);
        assert_eq!(created.created_at, created.modified_at);

        let fetched = f.repo.get_by_id(created.id, &cancel).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.encrypted_metadata, "enc-meta");
        assert_eq!(fetched.encrypted_file_key, Some(key));

        let reader = f.repo.download_content(&fetched, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, b"ciphertext");
    }

    #[tokio::test]
    async fn create_keeps_caller_supplied_id() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        let created = f
            .repo
            .create(draft("u1", "f1").with_id(id), bytes(b"x"), &cancel)
            .await
            .unwrap();
        assert_eq!(created.id, id);
    }

    /// A second create reusing another record's id must not touch that record.
    async fn assert_reused_id_is_rejected(
        repo: &EncryptedFileRepository,
        content: &MemoryContentStore,
    ) {
        let cancel = CancellationToken::new();
        let alice = repo
            .create(draft("alice", "secret"), bytes(b"alice data"), &cancel)
            .await
            .unwrap();

        let err = repo
            .create(
                draft("mallory", "x").with_id(alice.id),
                bytes(b"mallory data"),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_uniqueness_violation(), "got {err}");
        assert_eq!(content.len().await, 1);

        assert_eq!(repo.get_by_id(alice.id, &cancel).await.unwrap(), Some(alice.clone()));
        let owned = repo
            .get_by_file_id("alice", "secret", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owned.user_id, "alice");
        assert_eq!(repo.list_by_user_id("alice", &cancel).await.unwrap(), vec![alice]);
        assert!(repo.list_by_user_id("mallory", &cancel).await.unwrap().is_empty());
        assert!(repo
            .get_by_file_id("mallory", "x", &cancel)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn create_with_taken_id_fails_in_memory() {
        let f = fixture();
        assert_reused_id_is_rejected(&f.repo, &f.content).await;
        assert_eq!(f.metadata.len().await, 1);
    }

    #[tokio::test]
    async fn create_with_taken_id_fails_on_redb() {
        let dir = tempfile::tempdir().unwrap();
        let content = Arc::new(MemoryContentStore::new(signer()));
        let metadata = Arc::new(FileDatabase::open(&dir.path().join("files.redb")).unwrap());
        let repo = EncryptedFileRepository::new(content.clone(), metadata.clone());

        assert_reused_id_is_rejected(&repo, &content).await;
        assert_eq!(metadata.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_fails_and_keeps_first_content() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let first = f
            .repo
            .create(draft("u1", "f1"), bytes(b"first"), &cancel)
            .await
            .unwrap();
        let err = f
            .repo
            .create(draft("u1", "f1"), bytes(b"second"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_uniqueness_violation(), "got {err}");

        // loser's blob was compensated
        assert_eq!(f.content.len().await, 1);
        let current = f
            .repo
            .get_by_file_id("u1", "f1", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, first.id);
        let reader = f.repo.download_content(&current, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, b"first");
    }

    #[tokio::test]
    async fn failed_upload_writes_no_metadata() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.content.fail_uploads(true);

        let err = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::Storage(_)));
        assert!(f.metadata.is_empty().await);
    }

    #[tokio::test]
    async fn failed_insert_removes_uploaded_blob() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.metadata.fail_inserts(true);

        let err = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FileRepositoryError::Metadata(MetadataStoreError::Unavailable(_))
        ));
        assert!(f.content.is_empty().await);
    }

    #[tokio::test]
    async fn failed_compensation_returns_insert_error_and_leaves_orphan() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.metadata.fail_inserts(true);
        f.content.fail_deletes(true);

        let err = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::Metadata(_)));
        assert!(f.metadata.is_empty().await);
        assert_eq!(f.content.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_input_touches_no_store() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let err = f
            .repo
            .create(draft("", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FileRepositoryError::Validation { field: "user_id", .. }
        ));
        assert_eq!(err.to_string(), "invalid user_id: cannot be empty");

        let err = f
            .repo
            .create(draft("u1", "../f1"), bytes(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FileRepositoryError::Validation { field: "file_id", .. }
        ));

        assert!(f.content.is_empty().await);
        assert!(f.metadata.is_empty().await);
    }

    // =========================================================================
    // update
    // =========================================================================

    #[tokio::test]
    async fn update_with_content_swaps_blob() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"old"), &cancel)
            .await
            .unwrap();

        let updated = f
            .repo
            .update_by_id(
                FileDraft::from(&created).with_encryption_version("v2"),
                Some(bytes(b"new content")),
                &cancel,
            )
            .await
            .unwrap();

        assert_ne!(updated.storage_path, created.storage_path);
        assert_eq!(updated.encrypted_size, 11);
        assert_eq!(updated.encryption_version, "v2");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.modified_at > created.modified_at);

        let reader = f.repo.download_content(&updated, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, b"new content");
        let old = f.content.download_file(&created.storage_path).await;
        assert!(old.err().is_some_and(|e| e.is_not_found()));
        assert_eq!(f.content.len().await, 1);
    }

    #[tokio::test]
    async fn update_without_content_keeps_blob() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"payload"), &cancel)
            .await
            .unwrap();

        let updated = f
            .repo
            .update_by_id(
                FileDraft::from(&created).with_encrypted_metadata("renamed"),
                None,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(updated.storage_path, created.storage_path);
        assert_eq!(updated.encrypted_size, created.encrypted_size);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.modified_at > created.modified_at);
        assert_eq!(updated.encrypted_metadata, "renamed");

        let stored = f.repo.get_by_id(created.id, &cancel).await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn update_overwrites_omitted_fields() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = EncryptedFileKey::new(vec![1; 40], vec![2; 24]).unwrap();
        let created = f
            .repo
            .create(draft("u1", "f1").with_encrypted_file_key(key), bytes(b"x"), &cancel)
            .await
            .unwrap();

        let updated = f
            .repo
            .update_by_id(FileDraft::new("u1", "f1").with_id(created.id), None, &cancel)
            .await
            .unwrap();
        assert_eq!(updated.encrypted_metadata, "");
        assert_eq!(updated.encrypted_file_key, None);
    }

    #[tokio::test]
    async fn update_survives_old_blob_delete_failure() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"old"), &cancel)
            .await
            .unwrap();

        f.content.fail_deletes(true);
        let updated = f
            .repo
            .update_by_id(FileDraft::from(&created), Some(bytes(b"new")), &cancel)
            .await
            .unwrap();

        let reader = f.repo.download_content(&updated, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, b"new");
        // old blob left behind for the sweep
        assert!(f.content.contains(&created.storage_path).await);
    }

    #[tokio::test]
    async fn failed_replace_keeps_old_record_and_removes_new_blob() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"old"), &cancel)
            .await
            .unwrap();

        f.metadata.fail_replaces(true);
        let err = f
            .repo
            .update_by_id(FileDraft::from(&created), Some(bytes(b"new")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::Metadata(_)));

        let stored = f.repo.get_by_id(created.id, &cancel).await.unwrap().unwrap();
        assert_eq!(stored, created);
        assert_eq!(f.content.len().await, 1);
        let reader = f.repo.download_content(&stored, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, b"old");
    }

    #[tokio::test]
    async fn update_requires_id() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let err = f
            .repo
            .update_by_id(draft("u1", "f1"), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::Validation { field: "id", .. }));
    }

    #[test]
    fn modified_at_always_advances() {
        let t = Utc::now();
        assert_eq!(next_modified_at(t, t), t + TimeDelta::nanoseconds(1));
        assert_eq!(
            next_modified_at(t, t - TimeDelta::seconds(5)),
            t + TimeDelta::nanoseconds(1)
        );
        let later = t + TimeDelta::milliseconds(3);
        assert_eq!(next_modified_at(t, later), later);
    }

    // =========================================================================
    // delete
    // =========================================================================

    #[tokio::test]
    async fn delete_removes_record_and_blob() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap();

        f.repo.delete_by_id(created.id, &cancel).await.unwrap();
        assert_eq!(f.repo.get_by_id(created.id, &cancel).await.unwrap(), None);
        assert!(f.content.is_empty().await);
    }

    #[tokio::test]
    async fn delete_succeeds_when_blob_delete_fails() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap();

        f.content.fail_deletes(true);
        f.repo.delete_by_id(created.id, &cancel).await.unwrap();
        assert_eq!(f.repo.get_by_id(created.id, &cancel).await.unwrap(), None);
        assert_eq!(
            f.repo.get_by_file_id("u1", "f1", &cancel).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn missing_record_is_not_found_without_mutation() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap();
        let ghost = Uuid::new_v4();

        let err = f.repo.delete_by_id(ghost, &cancel).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), format!("file not found: {ghost}"));

        let err = f
            .repo
            .update_by_id(draft("u1", "f2").with_id(ghost), Some(bytes(b"y")), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(f.content.len().await, 1);
        assert_eq!(f.metadata.len().await, 1);
        assert!(f.content.contains(&created.storage_path).await);
    }

    // =========================================================================
    // list, links, cancellation
    // =========================================================================

    #[tokio::test]
    async fn list_is_newest_first_and_scoped_to_user() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let first = f
            .repo
            .create(draft("u1", "a"), bytes(b"1"), &cancel)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = f
            .repo
            .create(draft("u1", "b"), bytes(b"2"), &cancel)
            .await
            .unwrap();
        f.repo
            .create(draft("u2", "a"), bytes(b"3"), &cancel)
            .await
            .unwrap();

        let ids: Vec<_> = f
            .repo
            .list_by_user_id("u1", &cancel)
            .await
            .unwrap()
            .into_iter()
            .map(|file| file.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert!(f.repo.list_by_user_id("u3", &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_ttl_is_bounded() {
        let f = fixture_with(RepositoryOptions {
            max_url_ttl: Duration::from_secs(60),
            ..RepositoryOptions::default()
        });
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap();

        for ttl in [Duration::ZERO, Duration::from_secs(61)] {
            let err = f
                .repo
                .get_download_url(&created, ttl, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, FileRepositoryError::Validation { field: "ttl", .. }));
        }
        f.repo
            .get_download_url(&created, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_store_call() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .repo
            .create(draft("u1", "f1"), bytes(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::Cancelled));
        assert!(f.content.is_empty().await);
        assert!(f.metadata.is_empty().await);
    }

    #[tokio::test]
    async fn cancellation_after_upload_writes_no_metadata() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let reader = CancelAtEof {
            inner: Cursor::new(vec![7; 64]),
            token: cancel.clone(),
        };

        let err = f
            .repo
            .create(draft("u1", "f1"), Box::new(reader), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::Cancelled));
        assert!(f.metadata.is_empty().await);
        assert!(f.content.is_empty().await);
    }

    #[tokio::test]
    async fn stalled_upload_times_out() {
        let f = fixture_with(RepositoryOptions {
            call_timeout: Some(Duration::from_millis(50)),
            ..RepositoryOptions::default()
        });
        let cancel = CancellationToken::new();

        let err = f
            .repo
            .create(draft("u1", "f1"), Box::new(Stalled), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FileRepositoryError::TimedOut(_)));
        assert!(f.metadata.is_empty().await);
    }

    #[tokio::test]
    async fn health_check_covers_both_stores() {
        let f = fixture();
        f.repo.health_check(&CancellationToken::new()).await.unwrap();
    }

    // =========================================================================
    // concurrent writers
    // =========================================================================

    /// Upload source that yields nothing until its writer half is fed.
    fn pending_upload() -> (DuplexStream, ContentReader) {
        let (tx, rx) = tokio::io::duplex(64);
        (tx, Box::new(rx))
    }

    async fn feed(mut tx: DuplexStream, data: &[u8]) {
        tx.write_all(data).await.unwrap();
        tx.shutdown().await.unwrap();
    }

    /// Holds the first `replace` until released, then forwards everything.
    struct HeldReplace {
        inner: MemoryMetadataStore,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait::async_trait]
    impl MetadataStore for HeldReplace {
        async fn insert(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError> {
            self.inner.insert(file).await
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptedFile>, MetadataStoreError> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_file_id(
            &self,
            user_id: &str,
            file_id: &str,
        ) -> Result<Option<EncryptedFile>, MetadataStoreError> {
            self.inner.find_by_file_id(user_id, file_id).await
        }

        async fn replace(&self, file: &EncryptedFile) -> Result<(), MetadataStoreError> {
            let gate = self.gate.lock().await.take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.inner.replace(file).await
        }

        async fn delete(&self, id: Uuid) -> Result<(), MetadataStoreError> {
            self.inner.delete(id).await
        }

        async fn list_by_user(
            &self,
            user_id: &str,
        ) -> Result<Vec<EncryptedFile>, MetadataStoreError> {
            self.inner.list_by_user(user_id).await
        }

        async fn storage_paths(&self) -> Result<HashSet<String>, MetadataStoreError> {
            self.inner.storage_paths().await
        }

        async fn health_check(&self) -> Result<(), MetadataStoreError> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn racing_creates_have_one_winner() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let (tx_a, rx_a) = pending_upload();
        let (tx_b, rx_b) = pending_upload();

        // both uploads are in flight before either insert runs
        let (a, b, ()) = tokio::join!(
            f.repo.create(draft("u1", "f1"), rx_a, &cancel),
            f.repo.create(draft("u1", "f1"), rx_b, &cancel),
            async {
                feed(tx_a, b"from a").await;
                feed(tx_b, b"from b").await;
            },
        );

        let (winner, loser) = match (a, b) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            (a, b) => panic!("expected exactly one winner, got {a:?} and {b:?}"),
        };
        assert!(loser.is_uniqueness_violation(), "got {loser}");

        assert_eq!(f.metadata.len().await, 1);
        assert_eq!(f.content.len().await, 1);
        assert!(f.content.contains(&winner.storage_path).await);
        let current = f
            .repo
            .get_by_file_id("u1", "f1", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current, winner);
    }

    #[tokio::test]
    async fn racing_creates_orphan_loser_blob_when_compensation_fails() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let (tx_a, rx_a) = pending_upload();
        let (tx_b, rx_b) = pending_upload();
        f.content.fail_deletes(true);

        let (a, b, ()) = tokio::join!(
            f.repo.create(draft("u1", "f1"), rx_a, &cancel),
            f.repo.create(draft("u1", "f1"), rx_b, &cancel),
            async {
                feed(tx_a, b"from a").await;
                feed(tx_b, b"from b").await;
            },
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(f.metadata.len().await, 1);
        // the loser's blob stays behind for the sweeper
        assert_eq!(f.content.len().await, 2);
    }

    #[tokio::test]
    async fn racing_updates_are_last_writer_wins() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let created = f
            .repo
            .create(draft("u1", "f1"), bytes(b"original"), &cancel)
            .await
            .unwrap();
        let (tx_a, rx_a) = pending_upload();
        let (tx_b, rx_b) = pending_upload();

        let (a_done, a_committed) = oneshot::channel();

        // both writers fetch the original before either replaces it; a
        // commits first, b last
        let (first, second, ()) = tokio::join!(
            async {
                let result = f
                    .repo
                    .update_by_id(FileDraft::from(&created), Some(rx_a), &cancel)
                    .await;
                let _ = a_done.send(());
                result
            },
            f.repo.update_by_id(FileDraft::from(&created), Some(rx_b), &cancel),
            async {
                feed(tx_a, b"writer a").await;
                let _ = a_committed.await;
                feed(tx_b, b"writer b").await;
            },
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        let current = f.repo.get_by_id(created.id, &cancel).await.unwrap().unwrap();
        assert_eq!(current, second);
        let reader = f.repo.download_content(&current, &cancel).await.unwrap();
        assert_eq!(read_all(reader).await, b"writer b");

        // the overwritten writer's blob is unreferenced, the original is gone
        assert!(f.content.contains(&first.storage_path).await);
        assert!(!f.content.contains(&created.storage_path).await);
        assert_eq!(f.content.len().await, 2);
    }

    #[tokio::test]
    async fn stale_update_can_point_record_at_deleted_blob() {
        let content = Arc::new(MemoryContentStore::new(signer()));
        let (release, gate) = oneshot::channel();
        let metadata = Arc::new(HeldReplace {
            inner: MemoryMetadataStore::new(),
            gate: Mutex::new(None),
        });
        let repo = EncryptedFileRepository::new(content.clone(), metadata.clone());
        let cancel = CancellationToken::new();

        let created = repo
            .create(draft("u1", "f1"), bytes(b"original"), &cancel)
            .await
            .unwrap();
        *metadata.gate.lock().await = Some(gate);

        // the metadata-only writer fetches first and is held at its replace;
        // the content writer then swaps the blob and deletes the original
        let (stale, fresh) = tokio::join!(
            repo.update_by_id(
                FileDraft::from(&created).with_encryption_version("v2"),
                None,
                &cancel,
            ),
            async {
                let fresh = repo
                    .update_by_id(FileDraft::from(&created), Some(bytes(b"replacement")), &cancel)
                    .await;
                let _ = release.send(());
                fresh
            },
        );
        let (stale, fresh) = (stale.unwrap(), fresh.unwrap());

        let current = repo.get_by_id(created.id, &cancel).await.unwrap().unwrap();
        assert_eq!(current, stale);
        assert_eq!(current.storage_path, created.storage_path);
        let err = repo.download_content(&current, &cancel).await.err().unwrap();
        assert!(matches!(err, FileRepositoryError::Storage(ref e) if e.is_not_found()));
        // the fresh writer's blob is orphaned
        assert!(content.contains(&fresh.storage_path).await);
    }

    // =========================================================================
    // filesystem + redb
    // =========================================================================

    #[tokio::test]
    async fn hundred_byte_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path());
        let signer = signer();
        let content: Arc<dyn ContentStore> =
            Arc::new(FsContentStore::open(paths.clone(), signer.clone()).unwrap());
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(FileDatabase::open(&paths.metadata_db()).unwrap());
        let repo = EncryptedFileRepository::new(content.clone(), metadata);
        let access = DirectAccess::new(signer, content);
        let cancel = CancellationToken::new();

        let payload: Vec<u8> = (0..100u8).collect();
        repo.create(draft("u1", "f1"), bytes(&payload), &cancel)
            .await
            .unwrap();

        let record = repo
            .get_by_file_id("u1", "f1", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.encrypted_size, 100);
        assert_eq!(repo.list_by_user_id("u1", &cancel).await.unwrap().len(), 1);

        let link = repo
            .get_download_url(&record, Duration::from_secs(300), &cancel)
            .await
            .unwrap();
        let before = link.expires_at - TimeDelta::seconds(1);
        let reader = access.open_url(&link.url, before).await.unwrap();
        assert_eq!(read_all(reader).await, payload);

        assert!(access.open_url(&link.url, link.expires_at).await.is_err());
        assert!(access
            .open_url(&link.url, link.expires_at + TimeDelta::minutes(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn two_files_list_newest_first_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path());
        let repo = EncryptedFileRepository::new(
            Arc::new(FsContentStore::open(paths.clone(), signer()).unwrap()),
            Arc::new(FileDatabase::open(&paths.metadata_db()).unwrap()),
        );
        let cancel = CancellationToken::new();

        let older = repo
            .create(draft("u1", "f1"), bytes(b"one"), &cancel)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = repo
            .create(draft("u1", "f2"), bytes(b"two"), &cancel)
            .await
            .unwrap();

        let listed = repo.list_by_user_id("u1", &cancel).await.unwrap();
        assert_eq!(listed, vec![newer, older]);
    }
}
