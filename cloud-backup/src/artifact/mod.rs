//! Full-strategy artifacts: naming, archiving, encryption and checksums.
//!
//! Persisted naming is `backup-<host>-<YYYYMMDD-HHMMSS>.tar.gz.enc` with a
//! sibling `<name>.sha256`.

pub mod archive;
pub mod checksum;
pub mod crypto;

use chrono::{DateTime, TimeZone};
use std::cmp::Ordering;
use std::path::PathBuf;

pub const ARTIFACT_PREFIX: &str = "backup-";
pub const ARTIFACT_SUFFIX: &str = ".tar.gz.enc";
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Timestamp layout embedded in artifact names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Artifact file name for `host` at `at` (one-second resolution)
pub fn artifact_name<Tz: TimeZone>(host: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}{}-{}{}",
        ARTIFACT_PREFIX,
        host,
        at.format(TIMESTAMP_FORMAT),
        ARTIFACT_SUFFIX
    )
}

/// Name of the unencrypted intermediate for an artifact name
pub fn archive_name(artifact: &str) -> String {
    artifact
        .strip_suffix(".enc")
        .unwrap_or(artifact)
        .to_string()
}

/// Companion checksum record name
pub fn checksum_name(artifact: &str) -> String {
    format!("{}{}", artifact, CHECKSUM_SUFFIX)
}

/// A remote artifact name that belongs to a given host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub name: String,
    /// `YYYYMMDD` or `YYYYMMDD-HHMMSS`
    pub timestamp: String,
}

impl ArtifactName {
    pub fn checksum_name(&self) -> String {
        checksum_name(&self.name)
    }
}

impl Ord for ArtifactName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ArtifactName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_artifact_timestamp(s: &str) -> bool {
    match s.split_once('-') {
        None => is_digits(s, 8),
        Some((date, time)) => is_digits(date, 8) && is_digits(time, 6),
    }
}

/// Parse `name` as an artifact of `host`.
///
/// The timestamp part must be exactly `YYYYMMDD` or `YYYYMMDD-HHMMSS`, so
/// artifacts of a host named `web-2` never match host `web`.
pub fn parse_artifact_name(host: &str, name: &str) -> Option<ArtifactName> {
    let rest = name.strip_prefix(ARTIFACT_PREFIX)?;
    let rest = rest.strip_prefix(host)?;
    let rest = rest.strip_prefix('-')?;
    let timestamp = rest.strip_suffix(ARTIFACT_SUFFIX)?;
    if !is_artifact_timestamp(timestamp) {
        return None;
    }
    Some(ArtifactName {
        name: name.to_string(),
        timestamp: timestamp.to_string(),
    })
}

/// An encrypted artifact with its checksum, ready for transport
#[derive(Debug, Clone)]
pub struct SealedArtifact {
    pub name: String,
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub stats: archive::ArchiveStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn test_artifact_name_format() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap()
            .and_utc();
        let name = artifact_name("web-01", &at);
        assert_eq!(name, "backup-web-01-20240307-040506.tar.gz.enc");
        assert_eq!(archive_name(&name), "backup-web-01-20240307-040506.tar.gz");
        assert_eq!(
            checksum_name(&name),
            "backup-web-01-20240307-040506.tar.gz.enc.sha256"
        );
    }

    #[test]
    fn test_parse_round_trips_generated_name() {
        let name = artifact_name("db", &Utc::now());
        assert!(parse_artifact_name("db", &name).is_some());
    }

    #[test]
    fn test_parse_accepts_date_only() {
        let parsed = parse_artifact_name("h", "backup-h-20240101.tar.gz.enc").unwrap();
        assert_eq!(parsed.timestamp, "20240101");
    }

    #[test]
    fn test_parse_rejects_other_hosts_and_files() {
        assert!(parse_artifact_name("web", "backup-web-2-20240101-000000.tar.gz.enc").is_none());
        assert!(parse_artifact_name("web", "backup-web-20240101.tar.gz.enc.sha256").is_none());
        assert!(parse_artifact_name("web", "backup-web-2024.tar.gz.enc").is_none());
        assert!(parse_artifact_name("web", "backup-webserver-20240101.tar.gz.enc").is_none());
        assert!(parse_artifact_name("web", "notes.txt").is_none());
    }

    #[test]
    fn test_ordering_by_timestamp() {
        let mut names = vec![
            parse_artifact_name("h", "backup-h-20240102-000000.tar.gz.enc").unwrap(),
            parse_artifact_name("h", "backup-h-20231231-235959.tar.gz.enc").unwrap(),
            parse_artifact_name("h", "backup-h-20240101-120000.tar.gz.enc").unwrap(),
        ];
        names.sort();
        let ordered: Vec<_> = names.iter().map(|n| n.timestamp.as_str()).collect();
        assert_eq!(
            ordered,
            vec!["20231231-235959", "20240101-120000", "20240102-000000"]
        );
    }
}
