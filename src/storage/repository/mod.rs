// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Repository layer over the content and metadata stores.

pub mod encrypted_files;

pub use encrypted_files::{
    EncryptedFileRepository, FileRepositoryError, FileRepositoryResult, RepositoryOptions,
};
