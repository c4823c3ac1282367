//! Preflight checks run before any resources are committed.

use crate::utils::{BackupError, Result};
use std::io;
use std::path::{Path, PathBuf};

/// Default free-space floor
pub const MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;

/// Result of a successful preflight
#[derive(Debug, Clone)]
pub struct PreflightReport {
    /// Sources that exist, in configured order
    pub valid_sources: Vec<PathBuf>,

    /// Sources that were not found (warnings)
    pub missing_sources: Vec<PathBuf>,

    /// Filesystem location the capacity check ran against
    pub checked_path: PathBuf,

    pub free_bytes: u64,
}

/// Free bytes available to unprivileged users on the filesystem holding
/// `path`. A path that does not exist yet is resolved to its nearest
/// existing ancestor.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."));

    let stat = nix::sys::statvfs::statvfs(existing).map_err(io::Error::from)?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

/// Split sources into existing and missing, preserving order
pub fn partition_sources(sources: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    sources.iter().cloned().partition(|s| s.exists())
}

/// Verify capacity on `space_path` and source existence.
///
/// Missing sources are reported, not fatal; an empty set of existing sources
/// is.
pub fn check(space_path: &Path, min_free_bytes: u64, sources: &[PathBuf]) -> Result<PreflightReport> {
    let free_bytes = available_space(space_path)?;
    if free_bytes < min_free_bytes {
        return Err(BackupError::InsufficientSpace {
            path: space_path.to_path_buf(),
            available: free_bytes,
            required: min_free_bytes,
        });
    }

    let (valid_sources, missing_sources) = partition_sources(sources);
    for missing in &missing_sources {
        tracing::warn!("Source path does not exist, skipping: {}", missing.display());
    }
    if valid_sources.is_empty() {
        return Err(BackupError::NoValidSources);
    }

    Ok(PreflightReport {
        valid_sources,
        missing_sources,
        checked_path: space_path.to_path_buf(),
        free_bytes,
    })
}
