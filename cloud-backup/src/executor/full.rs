//! Full strategy: archive, encrypt and checksum locally, then deliver.

use crate::artifact::{
    archive::{self, ArchiveStats},
    archive_name, artifact_name, checksum, checksum_name, crypto, SealedArtifact,
};
use crate::audit::AuditLog;
use crate::fs::walker::WalkOptions;
use crate::transfer::{ensure_remote_configured, verified_upload, RemoteLocation, RemoteStore, RetryPolicy};
use crate::utils::format::format_bytes;
use crate::utils::{BackupError, Result};
use chrono::Utc;
use secrecy::SecretString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Inputs for producing one artifact
pub struct ProduceRequest {
    pub host: String,
    pub sources: Vec<PathBuf>,
    pub walk: WalkOptions,
    pub work_dir: PathBuf,
    pub passphrase: SecretString,
}

/// Remove and recreate the working directory
pub fn reset_work_dir(work_dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(work_dir) {
        Ok(()) => debug!("Cleared stale working directory {}", work_dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(work_dir)
}

/// Best-effort removal of everything a failed run left behind
pub fn discard_work_dir(work_dir: &Path) {
    match std::fs::remove_dir_all(work_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to clean working directory {}: {}", work_dir.display(), e),
    }
}

fn producer_error(step: &str, e: impl std::fmt::Display) -> BackupError {
    BackupError::Producer(format!("{}: {}", step, e))
}

/// Blocking part of the producer. Runs on the blocking pool.
fn seal(request: &ProduceRequest) -> Result<SealedArtifact> {
    reset_work_dir(&request.work_dir).map_err(|e| producer_error("working directory", e))?;

    // UTC keeps embedded timestamps monotonic across DST changes.
    let name = artifact_name(&request.host, &Utc::now());
    let archive_path = request.work_dir.join(archive_name(&name));
    let artifact_path = request.work_dir.join(&name);

    // The staging directory may sit below a source; never archive it.
    let mut walk = request.walk.clone();
    walk.exclude_paths.push(request.work_dir.clone());
    let stats: ArchiveStats = archive::create_archive(&request.sources, &walk, &archive_path)
        .map_err(|e| producer_error("archive", e))?;

    crypto::encrypt_file(&archive_path, &artifact_path, &request.passphrase)
        .map_err(|e| producer_error("encryption", e))?;

    // The plaintext must not outlive a successful encryption.
    std::fs::remove_file(&archive_path)
        .map_err(|e| producer_error("removing unencrypted archive", e))?;

    let (checksum_path, sha256) = checksum::write_checksum_file(&artifact_path)
        .map_err(|e| producer_error("checksum", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&artifact_path, std::fs::Permissions::from_mode(0o400))
            .map_err(|e| producer_error("sealing artifact", e))?;
    }

    let size = std::fs::metadata(&artifact_path)?.len();
    Ok(SealedArtifact {
        name,
        path: artifact_path,
        checksum_path,
        sha256,
        size,
        stats,
    })
}

/// Build the encrypted artifact and its checksum in the working directory
pub async fn produce(request: ProduceRequest, audit: &AuditLog) -> Result<SealedArtifact> {
    let artifact = tokio::task::spawn_blocking(move || seal(&request))
        .await
        .map_err(|e| producer_error("archiver task", e))??;

    for skipped in &artifact.stats.skipped {
        audit.warning(format!("Skipped unreadable file {}", skipped.display()));
    }
    audit.info(format!(
        "Created {} ({}, {} files, {} uncompressed)",
        artifact.name,
        format_bytes(artifact.size),
        artifact.stats.files,
        format_bytes(artifact.stats.bytes)
    ));
    audit.info(format!("Checksum {}  {}", artifact.sha256, artifact.name));
    Ok(artifact)
}

/// Deliver the artifact and its checksum, then drop the local copies
pub async fn transport(
    store: &dyn RemoteStore,
    location: &RemoteLocation,
    artifact: &SealedArtifact,
    policy: &RetryPolicy,
    audit: &AuditLog,
) -> Result<u64> {
    ensure_remote_configured(store, location).await?;

    let remote_file = location.file(&artifact.name);
    let size = verified_upload(store, &artifact.path, &remote_file, policy).await?;
    audit.info(format!("Uploaded {} ({}), size verified", remote_file, format_bytes(size)));

    let remote_checksum = location.file(&checksum_name(&artifact.name));
    match store.copy(&artifact.checksum_path, &remote_checksum).await {
        Ok(()) => audit.info(format!("Uploaded checksum {}", remote_checksum)),
        Err(e) => audit.warning(format!("Checksum upload failed: {}", e)),
    }

    for local in [&artifact.path, &artifact.checksum_path] {
        if let Err(e) = std::fs::remove_file(local) {
            audit.warning(format!("Failed to remove local copy {}: {}", local.display(), e));
        }
    }
    Ok(size)
}
