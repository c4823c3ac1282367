//! Filesystem-facing helpers: source traversal and preflight checks.

pub mod preflight;
pub mod walker;
