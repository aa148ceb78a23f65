// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Liveness and readiness probes.
//!
//! `/health` never touches storage. `/ready` probes the content and metadata
//! stores concurrently and answers 503 unless both respond in time.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;
use crate::storage::FileRepositoryResult;

/// Upper bound on a readiness probe.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct Liveness {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Readiness {
    /// `ok` when every store answered, `degraded` otherwise.
    pub status: &'static str,
    pub stores: StoreStatus,
}

#[derive(Debug, Serialize)]
pub struct StoreStatus {
    pub content: &'static str,
    pub metadata: &'static str,
}

pub async fn liveness() -> Json<Liveness> {
    Json(Liveness { status: "ok" })
}

fn probe_status(store: &'static str, result: Option<FileRepositoryResult<()>>) -> &'static str {
    match result {
        Some(Ok(())) => "ok",
        Some(Err(e)) => {
            tracing::warn!(store, error = %e, "Store health check failed");
            "unavailable"
        }
        None => {
            tracing::warn!(store, "Store health check timed out");
            "timeout"
        }
    }
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let cancel = CancellationToken::new();
    let repository = &state.repository;

    let (content, metadata) = tokio::join!(
        tokio::time::timeout(READY_TIMEOUT, repository.content_health(&cancel)),
        tokio::time::timeout(READY_TIMEOUT, repository.metadata_health(&cancel)),
    );
    cancel.cancel();

    let stores = StoreStatus {
        content: probe_status("content", content.ok()),
        metadata: probe_status("metadata", metadata.ok()),
    };
    let ready = stores.content == "ok" && stores.metadata == "ok";

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Readiness {
        status: if ready { "ok" } else { "degraded" },
        stores,
    };
    (status, Json(body))
}
