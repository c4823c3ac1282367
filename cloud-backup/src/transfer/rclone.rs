//! `rclone`-backed remote store.

use super::{RemoteEntry, RemoteLocation, RemoteStore};
use crate::utils::process::{ToolCommand, ToolOutput};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// rclone exits with 3 when the listed directory does not exist
const EXIT_DIR_NOT_FOUND: i32 = 3;

pub struct RcloneStore {
    binary: PathBuf,
}

/// One element of `rclone lsjson` output
#[derive(Debug, Deserialize)]
struct LsJsonEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
}

/// `rclone size --json` output
#[derive(Debug, Deserialize)]
struct SizeReport {
    count: u64,
    bytes: i64,
}

impl RcloneStore {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, command: ToolCommand) -> Result<ToolOutput> {
        command
            .output()
            .await
            .map_err(|e| BackupError::Transport(e.to_string()))
    }

    fn command(&self) -> ToolCommand {
        ToolCommand::new(&self.binary)
    }
}

fn check(output: ToolOutput, what: &str) -> Result<ToolOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(BackupError::Transport(format!(
            "rclone {} failed: {}",
            what,
            output.error_summary()
        )))
    }
}

pub(crate) fn parse_listremotes(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.trim_end_matches(':').to_string())
        .collect()
}

pub(crate) fn parse_lsjson(stdout: &str) -> Result<Vec<RemoteEntry>> {
    let entries: Vec<LsJsonEntry> = serde_json::from_str(stdout)
        .map_err(|e| BackupError::Transport(format!("unexpected lsjson output: {}", e)))?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| RemoteEntry {
            name: e.name,
            size: e.size.max(0) as u64,
        })
        .collect())
}

pub(crate) fn parse_size(stdout: &str) -> Result<u64> {
    let report: SizeReport = serde_json::from_str(stdout)
        .map_err(|e| BackupError::Transport(format!("unexpected size output: {}", e)))?;
    if report.count == 0 || report.bytes < 0 {
        return Err(BackupError::Transport("remote file not found".into()));
    }
    Ok(report.bytes as u64)
}

#[async_trait]
impl RemoteStore for RcloneStore {
    async fn list_remotes(&self) -> Result<Vec<String>> {
        let output = self.run(self.command().arg("listremotes")).await?;
        let output = check(output, "listremotes")?;
        Ok(parse_listremotes(&output.stdout))
    }

    async fn list_dir(&self, location: &RemoteLocation) -> Result<Vec<RemoteEntry>> {
        let output = self
            .run(
                self.command()
                    .args(["lsjson", "--files-only", "--no-mimetype", "--no-modtime"])
                    .arg(location.dir()),
            )
            .await?;
        if output.status == Some(EXIT_DIR_NOT_FOUND) {
            debug!("Remote directory {} does not exist yet", location);
            return Ok(Vec::new());
        }
        let output = check(output, "lsjson")?;
        parse_lsjson(&output.stdout)
    }

    async fn copy(&self, local: &Path, remote_file: &str) -> Result<()> {
        let output = self
            .run(
                self.command()
                    .arg("copyto")
                    .arg(local.as_os_str())
                    .arg(remote_file),
            )
            .await?;
        check(output, "copyto").map(|_| ())
    }

    async fn delete(&self, remote_file: &str) -> Result<()> {
        let output = self.run(self.command().arg("deletefile").arg(remote_file)).await?;
        check(output, "deletefile").map(|_| ())
    }

    async fn size(&self, remote_file: &str) -> Result<u64> {
        let output = self
            .run(self.command().args(["size", "--json"]).arg(remote_file))
            .await?;
        let output = check(output, "size")?;
        parse_size(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listremotes() {
        let remotes = parse_listremotes("gdrive:\ns3-archive:\n\n");
        assert_eq!(remotes, vec!["gdrive", "s3-archive"]);
    }

    #[test]
    fn test_parse_lsjson_skips_directories() {
        let json = r#"[
            {"Path":"old","Name":"old","Size":-1,"IsDir":true},
            {"Path":"backup-h-20240101.tar.gz.enc","Name":"backup-h-20240101.tar.gz.enc","Size":2048,"IsDir":false}
        ]"#;
        let entries = parse_lsjson(json).unwrap();
        assert_eq!(
            entries,
            vec![RemoteEntry {
                name: "backup-h-20240101.tar.gz.enc".into(),
                size: 2048
            }]
        );
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size(r#"{"count":1,"bytes":4096,"sizeless":0}"#).unwrap(), 4096);
        assert!(parse_size(r#"{"count":0,"bytes":0}"#).is_err());
        assert!(parse_size("garbage").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_dir_missing_directory_is_empty() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-rclone");
        std::fs::write(&script, "#!/bin/sh\necho 'directory not found' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = RcloneStore::new(&script);
        let location = RemoteLocation::parse("remote:missing").unwrap();
        assert!(store.list_dir(&location).await.unwrap().is_empty());
        assert!(store.delete("remote:missing/x").await.is_err());
    }
}
