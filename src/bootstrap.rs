// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Composition root: builds the stores from [`AppConfig`] and passes them
//! explicitly into the repository, the HTTP state and the sweeper.

use std::sync::Arc;

use crate::config::{AppConfig, StorageBackend};
use crate::state::AppState;
use crate::storage::presign::WeakSecret;
use crate::storage::{
    ContentStore, DirectAccess, EncryptedFileRepository, FileDatabase, FileDbError,
    FsContentStore, MemoryContentStore, MemoryMetadataStore, MetadataStore, RepositoryOptions,
    UrlSigner,
};
use crate::sweeper::OrphanSweeper;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("URL signing: {0}")]
    Signer(#[from] WeakSecret),

    #[error("content store: {0}")]
    ContentStore(#[from] std::io::Error),

    #[error("metadata store: {0}")]
    MetadataStore(#[from] FileDbError),

    #[error("storage backend `s3` requires building with the `s3` feature")]
    S3Unavailable,
}

/// Everything `main` needs to serve.
pub struct App {
    pub state: AppState,
    pub sweeper: Option<OrphanSweeper>,
}

pub fn build_app(config: &AppConfig) -> Result<App, BootstrapError> {
    let signer = UrlSigner::new(&config.signing_secret, config.public_base_url.clone())?;
    let paths = config.storage_paths();

    let (content, metadata, direct_access): (
        Arc<dyn ContentStore>,
        Arc<dyn MetadataStore>,
        bool,
    ) = match config.backend {
        StorageBackend::Fs => (
            Arc::new(FsContentStore::open(paths.clone(), signer.clone())?),
            Arc::new(FileDatabase::open(&paths.metadata_db())?),
            true,
        ),
        StorageBackend::Memory => (
            Arc::new(MemoryContentStore::new(signer.clone())),
            Arc::new(MemoryMetadataStore::new()),
            true,
        ),
        StorageBackend::S3 => (
            s3_content_store(config)?,
            Arc::new(FileDatabase::open(&paths.metadata_db())?),
            false,
        ),
    };

    let repository = EncryptedFileRepository::with_options(
        content.clone(),
        metadata.clone(),
        RepositoryOptions {
            call_timeout: config.call_timeout,
            max_url_ttl: config.max_url_ttl,
        },
    );
    let direct_access = direct_access.then(|| DirectAccess::new(signer, content.clone()));

    let sweeper = config
        .sweep
        .map(|sweep| OrphanSweeper::new(content, metadata, sweep.interval, sweep.grace));

    tracing::info!(
        backend = ?config.backend,
        data_dir = %paths.root().display(),
        direct_access = direct_access.is_some(),
        orphan_sweep = sweeper.is_some(),
        "Storage initialized"
    );

    Ok(App {
        state: AppState::new(repository, direct_access),
        sweeper,
    })
}

#[cfg(feature = "s3")]
fn s3_content_store(config: &AppConfig) -> Result<Arc<dyn ContentStore>, BootstrapError> {
    use crate::storage::{S3ContentStore, S3Settings};

    let s3 = config.s3.clone().ok_or(BootstrapError::S3Unavailable)?;
    Ok(Arc::new(S3ContentStore::new(S3Settings {
        endpoint: s3.endpoint,
        region: s3.region,
        bucket: s3.bucket,
        access_key_id: s3.access_key_id,
        secret_access_key: s3.secret_access_key,
        force_path_style: s3.force_path_style,
    })))
}

#[cfg(not(feature = "s3"))]
fn s3_content_store(_config: &AppConfig) -> Result<Arc<dyn ContentStore>, BootstrapError> {
    Err(BootstrapError::S3Unavailable)
}
