// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Filesystem content store.
//!
//! Blobs live under `{root}/blobs/{user_id}/{file_id}/{blob_id}`. Writes go
//! to a `.partial` sibling that is fsynced and renamed into place, so a
//! reader never observes a half-written object. Download links are signed by
//! a [`UrlSigner`] and served by the `/blobs` route.
//!
//! The directory may sit on an encrypted mount; this module performs no
//! cryptography of its own.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::content::{ContentReader, ContentStore, ContentStoreError, ObjectInfo, StoredObject};
use super::paths::{new_storage_path, split_storage_path, StoragePaths, PARTIAL_SUFFIX};
use super::presign::UrlSigner;
use crate::models::PresignedUrl;

/// Content store backed by a local directory tree.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    paths: StoragePaths,
    signer: UrlSigner,
}

impl FsContentStore {
    /// Create the blob directory if needed and return the store.
    ///
    /// Safe to call multiple times.
    pub fn open(paths: StoragePaths, signer: UrlSigner) -> io::Result<Self> {
        std::fs::create_dir_all(paths.blobs_dir())?;
        Ok(Self { paths, signer })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    fn locate(&self, storage_path: &str) -> Result<PathBuf, ContentStoreError> {
        Ok(self.paths.blob(split_storage_path(storage_path)?))
    }

    async fn write_atomic(&self, target: &Path, mut content: ContentReader) -> io::Result<u64> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut temp = target.as_os_str().to_owned();
        temp.push(PARTIAL_SUFFIX);
        let temp = PathBuf::from(temp);
        let mut partial = PartialFile {
            path: temp.clone(),
            armed: true,
        };

        let mut file = File::create(&temp).await?;
        let size = tokio::io::copy(&mut content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, target).await?;

        partial.disarm();
        Ok(size)
    }
}

/// Removes an unfinished `.partial` file on error or when the upload
/// future is dropped mid-write.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn map_not_found(err: io::Error, storage_path: &str) -> ContentStoreError {
    if err.kind() == io::ErrorKind::NotFound {
        ContentStoreError::NotFound(storage_path.to_string())
    } else {
        ContentStoreError::Io(err)
    }
}

/// Names of the entries directly under `dir`, or nothing if it is gone.
async fn entries(dir: &Path) -> io::Result<Vec<(String, PathBuf, std::fs::FileType)>> {
    let mut out = Vec::new();
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    while let Some(entry) = reader.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        out.push((name, entry.path(), entry.file_type().await?));
    }
    Ok(out)
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn upload_file(
        &self,
        owner_id: &str,
        content_id: &str,
        content: ContentReader,
    ) -> Result<StoredObject, ContentStoreError> {
        let storage_path = new_storage_path(owner_id, content_id)?;
        let target = self.locate(&storage_path)?;
        let size = self.write_atomic(&target, content).await?;

        tracing::debug!(storage_path = %storage_path, size, "Blob written");
        Ok(StoredObject { storage_path, size })
    }

    async fn download_file(&self, storage_path: &str) -> Result<ContentReader, ContentStoreError> {
        let path = self.locate(storage_path)?;
        let file = File::open(&path)
            .await
            .map_err(|e| map_not_found(e, storage_path))?;
        Ok(Box::new(file))
    }

    async fn delete_file(&self, storage_path: &str) -> Result<(), ContentStoreError> {
        let path = self.locate(storage_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(storage_path = %storage_path, "Blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ContentStoreError::Io(e)),
        }
    }

    async fn get_download_url(
        &self,
        storage_path: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ContentStoreError> {
        let path = self.locate(storage_path)?;
        fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(e, storage_path))?;
        self.signer.sign(storage_path, ttl, Utc::now())
    }

    async fn list_objects(&self) -> Result<Vec<ObjectInfo>, ContentStoreError> {
        let mut objects = Vec::new();
        for (owner, owner_dir, owner_type) in entries(&self.paths.blobs_dir()).await? {
            if !owner_type.is_dir() {
                continue;
            }
            for (content, content_dir, content_type) in entries(&owner_dir).await? {
                if !content_type.is_dir() {
                    continue;
                }
                for (blob, blob_path, blob_type) in entries(&content_dir).await? {
                    if !blob_type.is_file() {
                        continue;
                    }
                    let storage_path = format!("{owner}/{content}/{blob}");
                    if split_storage_path(&storage_path).is_err() {
                        continue;
                    }
                    let modified = match fs::metadata(&blob_path).await {
                        Ok(meta) => meta.modified()?,
                        // removed while listing
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    objects.push(ObjectInfo {
                        storage_path,
                        last_modified: DateTime::<Utc>::from(modified),
                    });
                }
            }
        }
        Ok(objects)
    }

    /// Write-read-delete probe under the data root.
    async fn health_check(&self) -> Result<(), ContentStoreError> {
        let probe = self.paths.blobs_dir().join(".health_check");
        let data = b"health_check_data";

        fs::write(&probe, data).await?;
        let read_back = fs::read(&probe).await?;
        fs::remove_file(&probe).await?;

        if read_back != data {
            return Err(ContentStoreError::Backend(
                "health check data mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use url::Url;

    fn store(root: &Path) -> FsContentStore {
        let signer = UrlSigner::new(
            &[3u8; 32],
            Url::parse("http://127.0.0.1:8080").unwrap(),
        )
        .unwrap();
        FsContentStore::open(StoragePaths::new(root), signer).unwrap()
    }

    fn reader(bytes: &[u8]) -> ContentReader {
        Box::new(Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn upload_then_download() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let stored = store
            .upload_file("u1", "f1", reader(&[0xAA; 100]))
            .await
            .unwrap();
        assert_eq!(stored.size, 100);
        assert!(stored.storage_path.starts_with("u1/f1/"));

        let mut out = Vec::new();
        store
            .download_file(&stored.storage_path)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![0xAA; 100]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let stored = store.upload_file("u1", "f1", reader(b"x")).await.unwrap();

        store.delete_file(&stored.storage_path).await.unwrap();
        store.delete_file(&stored.storage_path).await.unwrap();

        let err = store.download_file(&stored.storage_path).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejects_unsafe_identifiers() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let err = store.upload_file("..", "f1", reader(b"x")).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::InvalidPath(_)));
        assert!(store.download_file("../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn listing_skips_partial_objects() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let stored = store.upload_file("u1", "f1", reader(b"abc")).await.unwrap();

        let partial = dir.path().join("blobs/u1/f1/deadbeef.partial");
        std::fs::write(&partial, b"half").unwrap();

        let objects = store.list_objects().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].storage_path, stored.storage_path);
    }

    #[tokio::test]
    async fn download_url_requires_existing_object() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let err = store
            .get_download_url("u1/f1/missing", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let stored = store.upload_file("u1", "f1", reader(b"abc")).await.unwrap();
        let link = store
            .get_download_url(&stored.storage_path, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(link.url.path().ends_with(&stored.storage_path));
        assert!(link.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let dir = tempdir().unwrap();
        store(dir.path()).health_check().await.unwrap();
    }
}
