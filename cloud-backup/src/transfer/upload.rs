//! Verified upload: a transfer only counts once the remote reports the same
//! size as the local file.

use super::{RemoteLocation, RemoteStore, RetryPolicy};
use crate::utils::{BackupError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

/// Fail fast when the destination's remote is not configured in the
/// transport utility. Retrying cannot fix a configuration defect.
pub async fn ensure_remote_configured(
    store: &dyn RemoteStore,
    location: &RemoteLocation,
) -> Result<()> {
    let remotes = store.list_remotes().await?;
    if remotes.iter().any(|r| r == &location.remote) {
        Ok(())
    } else {
        Err(BackupError::Transport(format!(
            "remote '{}' is not configured (known: {})",
            location.remote,
            if remotes.is_empty() {
                "none".to_string()
            } else {
                remotes.join(", ")
            }
        )))
    }
}

/// Upload `local` to `remote_file`, re-uploading the whole file on every
/// attempt until the remote-reported size equals the local size.
///
/// A failed attempt removes whatever it left at `remote_file`, so an
/// exhausted budget never leaves a truncated artifact behind.
///
/// Returns the verified size.
pub async fn verified_upload(
    store: &dyn RemoteStore,
    local: &Path,
    remote_file: &str,
    policy: &RetryPolicy,
) -> Result<u64> {
    let local_size = tokio::fs::metadata(local).await?.len();

    policy
        .run("Upload", |attempt| async move {
            info!(
                "Uploading {} to {} (attempt {}/{})",
                local.display(),
                remote_file,
                attempt,
                policy.max_attempts
            );
            let outcome = upload_once(store, local, remote_file, local_size).await;
            if outcome.is_err() {
                discard_partial(store, remote_file).await;
            }
            outcome
        })
        .await
        .map_err(|e| BackupError::Transport(e.to_string()))
}

async fn upload_once(
    store: &dyn RemoteStore,
    local: &Path,
    remote_file: &str,
    local_size: u64,
) -> Result<u64> {
    store.copy(local, remote_file).await?;

    let remote_size = store.size(remote_file).await?;
    if remote_size != local_size {
        return Err(BackupError::Transport(format!(
            "size mismatch after upload: local {} bytes, remote {} bytes",
            local_size, remote_size
        )));
    }
    Ok(remote_size)
}

/// Best-effort removal of an unverified remote copy
async fn discard_partial(store: &dyn RemoteStore, remote_file: &str) {
    if store.size(remote_file).await.is_err() {
        debug!("Nothing to clean up at {}", remote_file);
        return;
    }
    match store.delete(remote_file).await {
        Ok(()) => info!("Removed unverified upload {}", remote_file),
        Err(e) => warn!("Failed to remove unverified upload {}: {}", remote_file, e),
    }
}
