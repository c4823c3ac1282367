//! Process-level concerns: the single-instance lock and signal handling.

pub mod lock;
pub mod shutdown;

pub use lock::{LockGuard, LockInfo, LockManager};
pub use shutdown::{wait_for_signal, ShutdownSignal};
