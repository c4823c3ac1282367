//! Incremental strategy: the engine snapshots and ships the data itself.

use crate::audit::AuditLog;
use crate::engine::{ensure_repository_initialized, SnapshotEngine, SnapshotSummary};
use crate::utils::format::format_bytes;
use crate::utils::Result;
use std::path::PathBuf;

pub async fn produce(
    engine: &dyn SnapshotEngine,
    sources: &[PathBuf],
    host: &str,
    excludes: &[String],
    audit: &AuditLog,
) -> Result<SnapshotSummary> {
    if ensure_repository_initialized(engine).await? {
        audit.info("Initialized new snapshot repository");
    }

    let summary = engine.backup(sources, host, excludes).await?;
    if summary.incomplete {
        audit.warning(format!(
            "Snapshot {} is incomplete, {} entries could not be read",
            summary.snapshot_id,
            summary.errors.len()
        ));
        for error in &summary.errors {
            audit.warning(format!("Unreadable: {}", error));
        }
    }
    audit.info(format!(
        "Snapshot {} created: {} new, {} changed, {} unmodified files, {} added",
        summary.snapshot_id,
        summary.files_new,
        summary.files_changed,
        summary.files_unmodified,
        format_bytes(summary.data_added)
    ));
    Ok(summary)
}

/// Repository size for reporting; a failure only costs the figure
pub async fn repository_size(engine: &dyn SnapshotEngine, audit: &AuditLog) -> Option<u64> {
    match engine.stats().await {
        Ok(stats) => Some(stats.total_size),
        Err(e) => {
            audit.warning(format!("Could not read repository statistics: {}", e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use crate::utils::BackupError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_first_run_initializes_repository() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path().join("audit.log")).unwrap();
        let engine = FakeEngine::new();

        let summary = produce(&engine, &[dir.path().to_path_buf()], "h", &[], &audit)
            .await
            .unwrap();
        assert!(!summary.snapshot_id.is_empty());
        assert_eq!(engine.init_calls(), 1);
        assert_eq!(engine.backups()[0].1, "h");
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal_before_backup() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path().join("audit.log")).unwrap();
        let engine = FakeEngine::new();
        engine.fail_init(true);

        let err = produce(&engine, &[dir.path().to_path_buf()], "h", &[], &audit)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Producer(_)));
        assert!(engine.backups().is_empty());
    }
}
