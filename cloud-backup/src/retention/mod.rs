//! Retention enforcement for both strategies.
//!
//! Failures here never fail a run: a backup that was delivered stays a
//! success even when old copies could not be cleaned up.

use crate::artifact::{parse_artifact_name, ArtifactName};
use crate::audit::AuditLog;
use crate::config::RetentionPolicy;
use crate::engine::SnapshotEngine;
use crate::transfer::{RemoteLocation, RemoteStore};
use std::collections::HashSet;
use tracing::debug;

/// Result of a Full-strategy sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Artifacts of this host left on the remote
    pub retained: usize,
    /// Remote files removed (artifacts and their checksum records)
    pub deleted: Vec<String>,
    /// Remote files that could not be removed
    pub failed: Vec<String>,
}

/// Artifacts of `host` that fall outside the newest `max_keep`, oldest first.
///
/// Names that do not belong to `host` are ignored. `max_keep == 0` keeps
/// everything.
pub fn plan_artifact_prune<S: AsRef<str>>(host: &str, names: &[S], max_keep: u32) -> Vec<ArtifactName> {
    if max_keep == 0 {
        return Vec::new();
    }
    let mut artifacts: Vec<ArtifactName> = names
        .iter()
        .filter_map(|n| parse_artifact_name(host, n.as_ref()))
        .collect();
    artifacts.sort();
    artifacts.dedup();
    let excess = artifacts.len().saturating_sub(max_keep as usize);
    artifacts.truncate(excess);
    artifacts
}

/// Delete this host's artifacts beyond the newest `max_keep`.
///
/// Returns `None` when the remote could not be listed. Individual delete
/// failures are recorded and the sweep continues.
pub async fn enforce_artifacts(
    store: &dyn RemoteStore,
    location: &RemoteLocation,
    host: &str,
    max_keep: u32,
    audit: &AuditLog,
) -> Option<PruneOutcome> {
    let entries = match store.list_dir(location).await {
        Ok(entries) => entries,
        Err(e) => {
            audit.warning(format!("Retention skipped, could not list {}: {}", location, e));
            return None;
        }
    };
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    let present: HashSet<&str> = names.iter().copied().collect();
    let owned = names
        .iter()
        .filter(|n| parse_artifact_name(host, n).is_some())
        .count();

    let doomed = plan_artifact_prune(host, &names, max_keep);
    if doomed.is_empty() {
        debug!("{} artifact(s) on remote, nothing to prune", owned);
        return Some(PruneOutcome {
            retained: owned,
            ..Default::default()
        });
    }

    let mut outcome = PruneOutcome {
        retained: owned - doomed.len(),
        ..Default::default()
    };
    for artifact in &doomed {
        let mut files = vec![artifact.name.clone()];
        let checksum = artifact.checksum_name();
        if present.contains(checksum.as_str()) {
            files.push(checksum);
        }
        for file in files {
            match store.delete(&location.file(&file)).await {
                Ok(()) => {
                    audit.info(format!("Deleted old backup {}", file));
                    outcome.deleted.push(file);
                }
                Err(e) => {
                    audit.warning(format!("Failed to delete old backup {}: {}", file, e));
                    outcome.failed.push(file);
                }
            }
        }
    }
    Some(outcome)
}

/// Apply the tiered policy to the host's snapshots.
///
/// Returns the number of snapshots left, or `None` if pruning failed.
pub async fn enforce_snapshots(
    engine: &dyn SnapshotEngine,
    host: &str,
    policy: &RetentionPolicy,
    audit: &AuditLog,
) -> Option<usize> {
    if policy.active_tiers().is_empty() {
        audit.info("No retention tiers enabled, keeping all snapshots");
    } else if let Err(e) = engine.forget(host, policy).await {
        audit.warning(format!("Snapshot retention failed: {}", e));
        return None;
    } else {
        audit.info("Applied snapshot retention policy");
    }

    match engine.snapshots(host).await {
        Ok(snapshots) => Some(snapshots.len()),
        Err(e) => {
            audit.warning(format!("Could not count snapshots after retention: {}", e));
            None
        }
    }
}
