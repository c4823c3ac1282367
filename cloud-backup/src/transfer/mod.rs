//! Transport layer: remote object storage access with verified delivery.
//!
//! The remote side is reached through the [`RemoteStore`] trait. The
//! production implementation drives the `rclone` utility; tests use an
//! in-memory store.

pub mod rclone;
pub mod retry;
pub mod upload;

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::Path;

pub use rclone::RcloneStore;
pub use retry::{RetryExhausted, RetryPolicy};
pub use upload::{ensure_remote_configured, verified_upload};

/// A destination locator of the form `remote-name:path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub remote: String,
    pub path: String,
}

impl RemoteLocation {
    pub fn parse(locator: &str) -> Result<Self> {
        let (remote, path) = locator.split_once(':').ok_or_else(|| {
            BackupError::Config(format!(
                "destination '{}' must have the form remote-name:path",
                locator
            ))
        })?;
        let remote = remote.trim();
        if remote.is_empty() || remote.contains('/') {
            return Err(BackupError::Config(format!(
                "destination '{}' has an invalid remote name",
                locator
            )));
        }
        Ok(Self {
            remote: remote.to_string(),
            path: path.trim_end_matches('/').to_string(),
        })
    }

    /// The directory itself, as understood by the transport utility
    pub fn dir(&self) -> String {
        format!("{}:{}", self.remote, self.path)
    }

    /// A file directly below the directory
    pub fn file(&self, name: &str) -> String {
        if self.path.is_empty() {
            format!("{}:{}", self.remote, name)
        } else {
            format!("{}:{}/{}", self.remote, self.path, name)
        }
    }
}

impl std::fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dir())
    }
}

/// A file listed in a remote directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
}

/// Operations consumed from the cloud transport utility
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Names of the configured remotes (without the trailing colon)
    async fn list_remotes(&self) -> Result<Vec<String>>;

    /// Files directly inside `location`; a missing directory lists as empty
    async fn list_dir(&self, location: &RemoteLocation) -> Result<Vec<RemoteEntry>>;

    /// Copy a local file to the exact remote file path
    async fn copy(&self, local: &Path, remote_file: &str) -> Result<()>;

    async fn delete(&self, remote_file: &str) -> Result<()>;

    /// Size of a remote file as reported by the remote
    async fn size(&self, remote_file: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let loc = RemoteLocation::parse("gdrive:backups/web/").unwrap();
        assert_eq!(loc.remote, "gdrive");
        assert_eq!(loc.path, "backups/web");
        assert_eq!(loc.dir(), "gdrive:backups/web");
        assert_eq!(loc.file("a.enc"), "gdrive:backups/web/a.enc");
    }

    #[test]
    fn test_parse_location_root() {
        let loc = RemoteLocation::parse("s3:").unwrap();
        assert_eq!(loc.file("a.enc"), "s3:a.enc");
    }

    #[test]
    fn test_parse_location_rejects_local_paths() {
        assert!(RemoteLocation::parse("/var/backups").is_err());
        assert!(RemoteLocation::parse(":path").is_err());
        assert!(RemoteLocation::parse("a/b:path").is_err());
    }
}
