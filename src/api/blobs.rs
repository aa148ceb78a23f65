// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Direct-access endpoint for signed links.
//!
//! `GET /blobs/{storage_path}?expires={unix_ms}&signature={mac}` streams the
//! ciphertext without any further authentication. The signature is the only
//! credential.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LinkQuery {
    pub expires: i64,
    pub signature: String,
}

pub async fn get_blob(
    State(state): State<AppState>,
    Path(storage_path): Path<String>,
    Query(link): Query<LinkQuery>,
) -> Result<Response, ApiError> {
    let access = state
        .direct_access
        .as_ref()
        .ok_or_else(|| ApiError::not_found("direct access is not served by this backend"))?;

    let reader = access
        .open(&storage_path, link.expires, &link.signature, Utc::now())
        .await
        .map_err(|e| {
            tracing::debug!(storage_path = %storage_path, error = %e, "Rejected blob link");
            ApiError::from(e)
        })?;

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream"),
        (header::CACHE_CONTROL, "private, no-store"),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(reader))).into_response())
}
