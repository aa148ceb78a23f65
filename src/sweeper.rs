// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Orphan Blob Sweeper
//!
//! Background task that removes blobs no metadata record references. Orphans
//! are the accepted failure mode of the repository: a compensating delete
//! that failed, an old blob whose delete failed after an update, or the
//! losing upload of two racing writers.
//!
//! ## Strategy
//!
//! Every `interval` the sweeper:
//! 1. Lists all objects in the content store.
//! 2. Lists every storage path referenced by a record. This happens after
//!    step 1, so a record committed in between is still seen.
//! 3. Deletes each unreferenced object whose `last_modified` is older than
//!    `grace`. The grace period covers uploads whose record insert is still
//!    in flight.
//!
//! The sweeper is opt-in and only started when an interval is configured.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::storage::{ContentStore, ContentStoreError, MetadataStore, MetadataStoreError};

/// Default minimum age of an unreferenced blob before it is deleted.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("listing blobs failed: {0}")]
    Content(#[from] ContentStoreError),

    #[error("listing referenced paths failed: {0}")]
    Metadata(#[from] MetadataStoreError),
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Objects examined.
    pub scanned: usize,
    /// Orphans removed.
    pub deleted: usize,
    /// Orphans whose delete failed.
    pub failed: usize,
}

/// Periodic reconciliation between the content and metadata stores.
pub struct OrphanSweeper {
    content: Arc<dyn ContentStore>,
    metadata: Arc<dyn MetadataStore>,
    interval: Duration,
    grace: Duration,
}

impl OrphanSweeper {
    pub fn new(
        content: Arc<dyn ContentStore>,
        metadata: Arc<dyn MetadataStore>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            content,
            metadata,
            interval,
            grace,
        }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(sweeper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.grace.as_secs(),
            "Orphan sweeper starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Orphan sweeper shutting down");
                    return;
                }
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.deleted > 0 || report.failed > 0 => {
                    info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        failed = report.failed,
                        "Orphan sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Orphan sweep failed"),
            }
        }
    }

    /// Execute one sweep as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let objects = self.content.list_objects().await?;
        let referenced = self.metadata.storage_paths().await?;
        let grace = TimeDelta::from_std(self.grace).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = SweepReport {
            scanned: objects.len(),
            ..SweepReport::default()
        };

        for object in objects {
            if referenced.contains(&object.storage_path) || object.last_modified > cutoff {
                continue;
            }
            match self.content.delete_file(&object.storage_path).await {
                Ok(()) => {
                    info!(storage_path = %object.storage_path, "Deleted orphan blob");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(
                        storage_path = %object.storage_path,
                        error = %e,
                        "Failed to delete orphan blob"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
