// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Two independent stores hold each encrypted file:
//!
//! - a **content store** with the ciphertext blob (filesystem, memory, or S3)
//! - a **metadata store** with the [`EncryptedFile`](crate::models::EncryptedFile)
//!   record (redb, or memory)
//!
//! The [`EncryptedFileRepository`] is the only component that touches both and
//! keeps them consistent.
//!
//! ## Storage Layout (filesystem backend)
//!
//! ```text
//! /data/
//!   blobs/{user_id}/{file_id}/{blob_id}   # ciphertext, written via .partial + rename
//!   metadata/files.redb                   # records + unique and timeline indexes
//! ```
//!
//! ## Important Notes
//!
//! - Blobs and record fields are ciphertext produced by clients
//! - DO NOT implement any crypto in this module

pub mod blob_fs;
pub mod content;
pub mod file_database;
pub mod memory;
pub mod metadata;
pub mod paths;
pub mod presign;
pub mod repository;
#[cfg(feature = "s3")]
pub mod s3;

pub use blob_fs::FsContentStore;
pub use content::{ContentReader, ContentStore, ContentStoreError, ObjectInfo, StoredObject};
pub use file_database::{FileDatabase, FileDbError};
pub use memory::{MemoryContentStore, MemoryMetadataStore};
pub use metadata::{MetadataStore, MetadataStoreError};
pub use paths::StoragePaths;
pub use presign::{DirectAccess, DirectAccessError, LinkError, UrlSigner};
pub use repository::{
    EncryptedFileRepository, FileRepositoryError, FileRepositoryResult, RepositoryOptions,
};
#[cfg(feature = "s3")]
pub use s3::{S3ContentStore, S3Settings};
