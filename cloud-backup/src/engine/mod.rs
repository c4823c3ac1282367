//! Incremental strategy: deduplicating snapshot engine.
//!
//! The engine owns chunking, deduplication and encryption of snapshot data;
//! the pipeline only drives it through [`SnapshotEngine`].

pub mod restic;

use crate::config::RetentionPolicy;
use crate::utils::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::path::PathBuf;
use tracing::info;

pub use restic::ResticEngine;

/// Outcome of one snapshot run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub snapshot_id: String,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub data_added: u64,
    pub total_bytes_processed: u64,
    /// Snapshot was written but some entries could not be read
    pub incomplete: bool,
    /// Per-entry read errors reported during the run
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<FixedOffset>,
    pub hostname: String,
    pub tags: Vec<String>,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoStats {
    pub total_size: u64,
    pub snapshots_count: u64,
}

#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Whether the repository exists and opens with the configured key
    async fn probe(&self) -> Result<bool>;

    async fn init(&self) -> Result<()>;

    /// Take a snapshot of `sources`, tagged with `host`
    async fn backup(&self, sources: &[PathBuf], host: &str, excludes: &[String]) -> Result<SnapshotSummary>;

    /// Snapshots tagged with `host`, oldest first
    async fn snapshots(&self, host: &str) -> Result<Vec<SnapshotInfo>>;

    /// Apply the tiered policy to `host`'s snapshots and reclaim space
    async fn forget(&self, host: &str, policy: &RetentionPolicy) -> Result<()>;

    async fn stats(&self) -> Result<RepoStats>;
}

/// Create the repository on first use. Returns `true` when it was created.
pub async fn ensure_repository_initialized(engine: &dyn SnapshotEngine) -> Result<bool> {
    if engine.probe().await? {
        return Ok(false);
    }
    info!("Snapshot repository not found, initializing");
    engine.init().await?;
    Ok(true)
}
