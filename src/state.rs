// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::storage::{DirectAccess, EncryptedFileRepository};

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<EncryptedFileRepository>,
    /// Resolver for signed links. `None` when the backend presigns natively.
    pub direct_access: Option<DirectAccess>,
}

impl AppState {
    pub fn new(repository: EncryptedFileRepository, direct_access: Option<DirectAccess>) -> Self {
        Self {
            repository: Arc::new(repository),
            direct_access,
        }
    }
}
