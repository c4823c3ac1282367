//! Utility modules for the backup pipeline.

pub mod errors;
pub mod format;
pub mod logger;
pub mod process;

pub use errors::{BackupError, Result};
