//! Cloud Backup Library
//!
//! One-shot backup runs for a single host: incremental snapshots through an
//! external snapshot engine, or full encrypted archives uploaded to a remote,
//! followed by retention, notification and an audit trail.

pub mod artifact;
pub mod audit;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod fs;
pub mod notify;
pub mod retention;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::{BackupError, Result};
