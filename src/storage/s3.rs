// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! S3-compatible content store (AWS, MinIO, SeaweedFS).
//!
//! Object keys are storage paths. Download links use native S3 presigning,
//! so blobs are served by the bucket rather than by this service.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{Client, Config};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::AsyncReadExt;
use url::Url;

use super::content::{ContentReader, ContentStore, ContentStoreError, ObjectInfo, StoredObject};
use super::paths::{new_storage_path, split_storage_path};
use crate::models::PresignedUrl;

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
}

/// Part size for multipart uploads. S3 requires at least 5 MiB for every
/// part but the last.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Refill `buf` with up to `PART_SIZE` bytes. Empty means end of stream.
async fn read_part(content: &mut ContentReader, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    content.take(PART_SIZE as u64).read_to_end(buf).await?;
    Ok(())
}

fn backend(err: impl std::error::Error) -> ContentStoreError {
    ContentStoreError::Backend(DisplayErrorContext(err).to_string())
}

#[derive(Debug, Clone)]
pub struct S3ContentStore {
    client: Client,
    bucket: String,
}

impl S3ContentStore {
    pub fn new(settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id,
            settings.secret_access_key,
            None,
            None,
            "vault-storage",
        );
        let config = Config::builder()
            .endpoint_url(settings.endpoint)
            .region(Region::new(settings.region))
            .credentials_provider(credentials)
            .force_path_style(settings.force_path_style)
            .behavior_version_latest()
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: settings.bucket,
        }
    }

    /// Stream the rest of `content` as a multipart upload starting with `first`.
    ///
    /// Holds one part in memory at a time. A failed upload is aborted; an
    /// upload whose future is dropped stays incomplete until the bucket's
    /// lifecycle rule expires it.
    async fn upload_multipart(
        &self,
        key: &str,
        content: ContentReader,
        first: Vec<u8>,
    ) -> Result<u64, ContentStoreError> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend)?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| ContentStoreError::Backend("missing multipart upload id".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, content, first).await {
            Ok(size) => Ok(size),
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        storage_path = %key,
                        error = %DisplayErrorContext(abort),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut content: ContentReader,
        mut part: Vec<u8>,
    ) -> Result<u64, ContentStoreError> {
        let mut completed = Vec::new();
        let mut size = 0u64;
        let mut number = 1;

        while !part.is_empty() {
            size += part.len() as u64;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .body(ByteStream::from(std::mem::take(&mut part)))
                .send()
                .await
                .map_err(backend)?;
            completed.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(number)
                    .build(),
            );

            read_part(&mut content, &mut part).await?;
            number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(backend)?;
        Ok(size)
    }

    async fn head(&self, storage_path: &str) -> Result<(), ContentStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(storage_path)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => {
                Err(ContentStoreError::NotFound(storage_path.to_string()))
            }
            Err(e) => Err(backend(e)),
        }
    }
}

#[async_trait]
impl ContentStore for S3ContentStore {
    async fn upload_file(
        &self,
        owner_id: &str,
        content_id: &str,
        mut content: ContentReader,
    ) -> Result<StoredObject, ContentStoreError> {
        let storage_path = new_storage_path(owner_id, content_id)?;

        let mut first = Vec::with_capacity(PART_SIZE);
        read_part(&mut content, &mut first).await?;

        let size = if first.len() < PART_SIZE {
            let size = first.len() as u64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&storage_path)
                .content_length(size as i64)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(backend)?;
            size
        } else {
            self.upload_multipart(&storage_path, content, first).await?
        };

        tracing::debug!(storage_path = %storage_path, size, "Object uploaded");
        Ok(StoredObject { storage_path, size })
    }

    async fn download_file(&self, storage_path: &str) -> Result<ContentReader, ContentStoreError> {
        split_storage_path(storage_path)?;
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(storage_path)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(ContentStoreError::NotFound(storage_path.to_string()));
            }
            Err(e) => return Err(backend(e)),
        };

        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn delete_file(&self, storage_path: &str) -> Result<(), ContentStoreError> {
        split_storage_path(storage_path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(storage_path)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_download_url(
        &self,
        storage_path: &str,
        ttl: Duration,
    ) -> Result<PresignedUrl, ContentStoreError> {
        split_storage_path(storage_path)?;
        let delta = TimeDelta::from_std(ttl).map_err(|_| ContentStoreError::InvalidTtl(ttl))?;
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|_| ContentStoreError::InvalidTtl(ttl))?;
        self.head(storage_path).await?;

        let now = Utc::now();
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(storage_path)
            .presigned(config)
            .await
            .map_err(backend)?;
        let url = Url::parse(request.uri())
            .map_err(|e| ContentStoreError::Backend(format!("presigned URL: {e}")))?;

        Ok(PresignedUrl {
            url,
            expires_at: now + delta,
        })
    }

    async fn list_objects(&self) -> Result<Vec<ObjectInfo>, ContentStoreError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(backend)?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if split_storage_path(key).is_err() {
                    continue;
                }
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
                    // unknown age is never old enough to sweep
                    .unwrap_or_else(Utc::now);
                objects.push(ObjectInfo {
                    storage_path: key.to_string(),
                    last_modified,
                });
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn health_check(&self) -> Result<(), ContentStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }
}
