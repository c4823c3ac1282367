//! Error taxonomy for the backup pipeline.
//!
//! Only fatal conditions are represented here. Retention and notification
//! problems are logged as warnings and never escalate into a `BackupError`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Another backup is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    #[error(
        "Insufficient disk space on {}: {available} bytes available, {required} required",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("None of the configured source paths exist")]
    NoValidSources,

    #[error("Backup creation failed: {0}")]
    Producer(String),

    #[error("Upload failed: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted by {0}")]
    Interrupted(&'static str),
}

impl BackupError {
    /// Process exit status reported to the external scheduler.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::AlreadyRunning { .. } => 2,
            BackupError::InsufficientSpace { .. } | BackupError::NoValidSources => 3,
            BackupError::Producer(_) | BackupError::Io(_) => 4,
            BackupError::Transport(_) => 5,
            BackupError::Config(_) => 78,
            BackupError::Interrupted("SIGTERM") => 143,
            BackupError::Interrupted(_) => 130,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
