//! Notification texts.

use crate::executor::{RunDetails, RunReport};
use crate::utils::format::{format_bytes, format_duration};
use std::fmt::Write as _;

pub fn success_message(report: &RunReport) -> String {
    let mut out = format!("Backup of {} succeeded ({})\n", report.host, report.strategy);
    match &report.details {
        RunDetails::Snapshot {
            summary,
            repository_size,
        } => {
            let _ = writeln!(out, "Snapshot: {}", summary.snapshot_id);
            let _ = writeln!(
                out,
                "Files: {} new, {} changed, {} unmodified",
                summary.files_new, summary.files_changed, summary.files_unmodified
            );
            let _ = writeln!(out, "Added: {}", format_bytes(summary.data_added));
            if let Some(count) = report.retained {
                let _ = writeln!(out, "Snapshots: {}", count);
            }
            if let Some(size) = repository_size {
                let _ = writeln!(out, "Repository size: {}", format_bytes(*size));
            }
            if summary.incomplete {
                let _ = writeln!(out, "Unreadable entries: {}", summary.errors.len());
            }
        }
        RunDetails::Artifact {
            name,
            size,
            files,
            skipped,
        } => {
            let _ = writeln!(out, "Artifact: {}", name);
            let _ = writeln!(out, "Size: {} ({} files)", format_bytes(*size), files);
            if *skipped > 0 {
                let _ = writeln!(out, "Skipped unreadable: {}", skipped);
            }
            if let Some(count) = report.retained {
                let _ = writeln!(out, "Backups kept: {}", count);
            }
        }
    }
    if !report.missing_sources.is_empty() {
        let missing: Vec<String> = report
            .missing_sources
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let _ = writeln!(out, "Missing sources: {}", missing.join(", "));
    }
    let _ = write!(out, "Duration: {}", format_duration(report.duration_secs));
    out
}

pub fn failure_message(host: &str, error: &dyn std::fmt::Display) -> String {
    format!("Backup of {} failed\n{}", host, error)
}
