//! Append-only audit trail of pipeline steps and outcomes.
//!
//! One line per event, `<YYYY-MM-DD HH:MM:SS>: <message>`. Failures carry an
//! `ERROR: ` prefix and warnings a `WARNING: ` prefix inside the message.
//! Every entry is mirrored into `tracing` at the matching level.

use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Warning,
    Failure,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub outcome: Outcome,
}

impl AuditEntry {
    pub fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
            outcome,
        }
    }
}

impl std::fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.outcome {
            Outcome::Success => "",
            Outcome::Warning => "WARNING: ",
            Outcome::Failure => "ERROR: ",
        };
        write!(
            f,
            "{}: {}{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            prefix,
            self.message
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open (creating if needed) the log for appending.
    ///
    /// Fails when the file cannot be written, so an unusable log is caught
    /// before a run starts.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(&AuditEntry::new(Outcome::Success, message));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.record(&AuditEntry::new(Outcome::Warning, message));
    }

    pub fn failure(&self, message: impl Into<String>) {
        self.record(&AuditEntry::new(Outcome::Failure, message));
    }

    /// Append one entry. A write failure is logged and otherwise ignored.
    pub fn record(&self, entry: &AuditEntry) {
        match entry.outcome {
            Outcome::Success => tracing::info!("{}", entry.message),
            Outcome::Warning => tracing::warn!("{}", entry.message),
            Outcome::Failure => tracing::error!("{}", entry.message),
        }

        let line = format!("{}\n", entry);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!("Failed to append to audit log {}: {}", self.path.display(), e);
        }
    }

    /// Last `n` lines of the log
    pub fn tail(&self, n: usize) -> io::Result<Vec<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_entry_format() {
        let entry = AuditEntry {
            timestamp: Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            message: "Upload failed".to_string(),
            outcome: Outcome::Failure,
        };
        assert_eq!(entry.to_string(), "2024-01-02 03:04:05: ERROR: Upload failed");

        let entry = AuditEntry {
            outcome: Outcome::Success,
            message: "Backup started".to_string(),
            ..entry
        };
        assert_eq!(entry.to_string(), "2024-01-02 03:04:05: Backup started");
    }

    #[test]
    fn test_appends_and_tails() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("logs/backup.log")).unwrap();
        log.info("one");
        log.warning("two");
        log.failure("three");

        let lines = log.tail(2).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": WARNING: two"));
        assert!(lines[1].ends_with(": ERROR: three"));

        // Reopening never truncates
        let log = AuditLog::open(log.path().to_path_buf()).unwrap();
        assert_eq!(log.tail(10).unwrap().len(), 3);
    }

    #[test]
    fn test_write_failure_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("backup.log")).unwrap();
        std::fs::remove_file(log.path()).unwrap();
        std::fs::create_dir(log.path()).unwrap();
        log.info("lost");
        assert!(log.tail(1).is_err());
    }

    #[test]
    fn test_open_fails_on_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        assert!(AuditLog::open(blocker.join("backup.log")).is_err());
    }
}
