// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Vault - Zero-Knowledge Encrypted File Storage
//!
//! Clients encrypt files and keys before upload. This crate stores the
//! ciphertext blob in a content store and a metadata record in a document
//! store, and keeps the two consistent across create, update and delete.
//!
//! ## Modules
//!
//! - `keys` - Key hierarchy data contract (wrapped keys, never decrypted)
//! - `models` - File records and inputs
//! - `storage` - Content/metadata stores and the encrypted file repository
//! - `sweeper` - Opt-in orphan blob reconciliation
//! - `api` - Health probes and the signed-link blob endpoint (Axum)

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod keys;
pub mod models;
pub mod state;
pub mod storage;
pub mod sweeper;
