//! `restic`-backed snapshot engine, storing its repository through rclone.

use super::{RepoStats, SnapshotEngine, SnapshotInfo, SnapshotSummary};
use crate::config::{RetentionPolicy, RetentionTier};
use crate::utils::process::{ToolCommand, ToolOutput};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Snapshot was created but some source files could not be read
const EXIT_INCOMPLETE: i32 = 3;

pub struct ResticEngine {
    binary: PathBuf,
    rclone: PathBuf,
    repository: String,
    password: SecretString,
}

#[derive(Debug, Deserialize)]
struct BackupMessage {
    message_type: String,
    #[serde(default)]
    snapshot_id: Option<String>,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    item: Option<String>,
    #[serde(default)]
    error: Option<BackupErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct BackupErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotJson {
    id: String,
    #[serde(default)]
    short_id: String,
    time: DateTime<FixedOffset>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StatsJson {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    snapshots_count: u64,
}

impl ResticEngine {
    /// Engine for the repository at rclone destination `destination`
    pub fn new(
        binary: impl Into<PathBuf>,
        rclone: impl Into<PathBuf>,
        destination: &str,
        password: SecretString,
    ) -> Self {
        Self {
            binary: binary.into(),
            rclone: rclone.into(),
            repository: format!("rclone:{}", destination),
            password,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn command(&self) -> ToolCommand {
        let mut rclone_program = std::ffi::OsString::from("rclone.program=");
        rclone_program.push(self.rclone.as_os_str());
        ToolCommand::new(&self.binary)
            .arg("-r")
            .arg(&self.repository)
            .arg("-o")
            .arg(rclone_program)
            .secret_env("RESTIC_PASSWORD", &self.password)
    }

    async fn run(&self, command: ToolCommand) -> Result<ToolOutput> {
        command
            .output()
            .await
            .map_err(|e| BackupError::Producer(e.to_string()))
    }
}

fn check(output: ToolOutput, what: &str) -> Result<ToolOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(BackupError::Producer(format!(
            "restic {} failed: {}",
            what,
            output.error_summary()
        )))
    }
}

/// `--keep-*` flags for every enabled tier
pub(crate) fn forget_args(host: &str, policy: &RetentionPolicy) -> Vec<String> {
    let tiers = policy.active_tiers();
    if tiers.is_empty() {
        return Vec::new();
    }
    let mut args = vec![
        "forget".to_string(),
        "--tag".to_string(),
        host.to_string(),
        "--prune".to_string(),
    ];
    for (tier, count) in tiers {
        let flag = match tier {
            RetentionTier::Last => "--keep-last",
            RetentionTier::Daily => "--keep-daily",
            RetentionTier::Weekly => "--keep-weekly",
            RetentionTier::Monthly => "--keep-monthly",
            RetentionTier::Yearly => "--keep-yearly",
        };
        args.push(flag.to_string());
        args.push(count.to_string());
    }
    args
}

/// Extract the summary from `restic backup --json` output.
///
/// Progress lines are ignored; error lines are collected.
pub(crate) fn parse_backup_output(stdout: &str) -> Result<SnapshotSummary> {
    let mut summary: Option<SnapshotSummary> = None;
    let mut errors = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let message: BackupMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                debug!("Ignoring unparseable restic output line: {}", e);
                continue;
            }
        };
        match message.message_type.as_str() {
            "summary" => {
                summary = Some(SnapshotSummary {
                    snapshot_id: message.snapshot_id.unwrap_or_default(),
                    files_new: message.files_new,
                    files_changed: message.files_changed,
                    files_unmodified: message.files_unmodified,
                    data_added: message.data_added,
                    total_bytes_processed: message.total_bytes_processed,
                    incomplete: false,
                    errors: Vec::new(),
                });
            }
            "error" => {
                let detail = message.error.map(|e| e.message).unwrap_or_default();
                errors.push(match message.item {
                    Some(item) => format!("{}: {}", item, detail),
                    None => detail,
                });
            }
            _ => {}
        }
    }

    let mut summary = summary.ok_or_else(|| {
        BackupError::Producer("restic backup produced no summary".into())
    })?;
    summary.errors = errors;
    Ok(summary)
}

pub(crate) fn parse_snapshots(stdout: &str) -> Result<Vec<SnapshotInfo>> {
    let raw: Vec<SnapshotJson> = serde_json::from_str(stdout)
        .map_err(|e| BackupError::Producer(format!("unexpected snapshots output: {}", e)))?;
    let mut snapshots: Vec<SnapshotInfo> = raw
        .into_iter()
        .map(|s| SnapshotInfo {
            id: s.id,
            short_id: s.short_id,
            time: s.time,
            hostname: s.hostname,
            tags: s.tags,
            paths: s.paths,
        })
        .collect();
    snapshots.sort_by_key(|s| s.time);
    Ok(snapshots)
}

pub(crate) fn parse_stats(stdout: &str) -> Result<RepoStats> {
    let raw: StatsJson = serde_json::from_str(stdout)
        .map_err(|e| BackupError::Producer(format!("unexpected stats output: {}", e)))?;
    Ok(RepoStats {
        total_size: raw.total_size,
        snapshots_count: raw.snapshots_count,
    })
}

#[async_trait]
impl SnapshotEngine for ResticEngine {
    async fn probe(&self) -> Result<bool> {
        let output = self.run(self.command().args(["cat", "config"])).await?;
        if !output.success() {
            debug!("Repository probe failed: {}", output.error_summary());
        }
        Ok(output.success())
    }

    async fn init(&self) -> Result<()> {
        let output = self.run(self.command().arg("init")).await?;
        check(output, "init").map(|_| ())
    }

    async fn backup(&self, sources: &[PathBuf], host: &str, excludes: &[String]) -> Result<SnapshotSummary> {
        let mut command = self
            .command()
            .args(["backup", "--json", "--host", host, "--tag", host]);
        for pattern in excludes {
            command = command.arg("--exclude").arg(pattern);
        }
        let command = command.args(sources.iter().map(|s| s.as_os_str()));

        let output = self.run(command).await?;
        match output.status {
            Some(0) => parse_backup_output(&output.stdout),
            Some(EXIT_INCOMPLETE) => {
                let mut summary = parse_backup_output(&output.stdout)?;
                summary.incomplete = true;
                warn!(
                    "Snapshot {} is incomplete: {} entries could not be read",
                    summary.snapshot_id,
                    summary.errors.len()
                );
                Ok(summary)
            }
            _ => Err(BackupError::Producer(format!(
                "restic backup failed: {}",
                output.error_summary()
            ))),
        }
    }

    async fn snapshots(&self, host: &str) -> Result<Vec<SnapshotInfo>> {
        let output = self
            .run(self.command().args(["snapshots", "--json", "--tag", host]))
            .await?;
        let output = check(output, "snapshots")?;
        parse_snapshots(&output.stdout)
    }

    async fn forget(&self, host: &str, policy: &RetentionPolicy) -> Result<()> {
        let args = forget_args(host, policy);
        if args.is_empty() {
            debug!("No retention tiers enabled, nothing to forget");
            return Ok(());
        }
        let output = self.run(self.command().args(args)).await?;
        check(output, "forget").map(|_| ())
    }

    async fn stats(&self) -> Result<RepoStats> {
        let output = self
            .run(self.command().args(["stats", "--json", "--mode", "raw-data"]))
            .await?;
        let output = check(output, "stats")?;
        parse_stats(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forget_args_only_enabled_tiers() {
        let policy = RetentionPolicy {
            keep_last: 0,
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 0,
            keep_yearly: 2,
            max_artifacts: 0,
        };
        assert_eq!(
            forget_args("web", &policy),
            vec![
                "forget", "--tag", "web", "--prune", "--keep-daily", "7", "--keep-weekly", "4",
                "--keep-yearly", "2"
            ]
        );
    }

    #[test]
    fn test_forget_args_empty_when_all_zero() {
        let policy = RetentionPolicy {
            keep_last: 0,
            keep_daily: 0,
            keep_weekly: 0,
            keep_monthly: 0,
            keep_yearly: 0,
            max_artifacts: 3,
        };
        assert!(forget_args("web", &policy).is_empty());
    }

    #[test]
    fn test_parse_backup_output() {
        let stdout = r#"{"message_type":"status","percent_done":0.5}
{"message_type":"error","error":{"message":"permission denied"},"during":"archival","item":"/etc/shadow"}
{"message_type":"summary","files_new":3,"files_changed":1,"files_unmodified":10,"dirs_new":0,"data_added":2048,"total_files_processed":14,"total_bytes_processed":9000,"snapshot_id":"abc123"}
"#;
        let summary = parse_backup_output(stdout).unwrap();
        assert_eq!(summary.snapshot_id, "abc123");
        assert_eq!(summary.files_new, 3);
        assert_eq!(summary.files_changed, 1);
        assert_eq!(summary.files_unmodified, 10);
        assert_eq!(summary.data_added, 2048);
        assert_eq!(summary.total_bytes_processed, 9000);
        assert_eq!(summary.errors, vec!["/etc/shadow: permission denied"]);
    }

    #[test]
    fn test_parse_backup_output_requires_summary() {
        assert!(parse_backup_output(r#"{"message_type":"status"}"#).is_err());
    }

    #[test]
    fn test_parse_snapshots_sorted() {
        let json = r#"[
            {"time":"2024-01-02T03:00:00.123456789+01:00","id":"bbb","short_id":"bb","hostname":"web","tags":["web"],"paths":["/etc"]},
            {"time":"2024-01-01T03:00:00Z","id":"aaa","short_id":"aa","hostname":"web","tags":["web"],"paths":["/etc"]}
        ]"#;
        let snapshots = parse_snapshots(json).unwrap();
        let ids: Vec<_> = snapshots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(r#"{"total_size":1048576,"total_uncompressed_size":2097152,"snapshots_count":4}"#)
            .unwrap();
        assert_eq!(stats, RepoStats { total_size: 1048576, snapshots_count: 4 });
    }

    #[test]
    fn test_command_keeps_password_out_of_arguments() {
        let engine = ResticEngine::new(
            "restic",
            "/usr/bin/rclone",
            "gdrive:backups",
            SecretString::from("s3cret-pass".to_string()),
        );
        let display = engine.command().args(["snapshots"]).display();
        assert_eq!(
            display,
            "restic -r rclone:gdrive:backups -o rclone.program=/usr/bin/rclone snapshots"
        );
        assert!(!display.contains("s3cret-pass"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_incomplete_snapshot_is_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-restic");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"message_type\":\"summary\",\"files_new\":1,\"snapshot_id\":\"f00\"}'\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = ResticEngine::new(&script, "rclone", "r:p", SecretString::from("pw".to_string()));
        let summary = engine
            .backup(&[dir.path().to_path_buf()], "web", &[])
            .await
            .unwrap();
        assert!(summary.incomplete);
        assert_eq!(summary.snapshot_id, "f00");
    }
}
