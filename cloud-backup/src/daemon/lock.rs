//! Single-instance guard backed by a pid file.
//!
//! The lock file holds the owner's process id and is kept under an exclusive
//! `flock` for as long as the guard lives. A contender that cannot take the
//! `flock` is rejected outright. One that can still honours a recorded pid
//! that is alive. Otherwise the file is stale and is rewritten in place while
//! locked, so two contenders can never both reclaim it.

use crate::utils::{BackupError, Result};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Attempts when the locked file turns out to have been replaced meanwhile
const ACQUIRE_ATTEMPTS: usize = 3;

/// What the lock file says about its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: Option<i32>,
    pub created: Option<DateTime<Local>>,
    pub alive: bool,
}

/// Whether `pid` names a running process.
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 || pid == std::process::id() as i32 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn parse_pid(content: &str) -> Option<i32> {
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

fn recorded_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|c| parse_pid(&c))
        .unwrap_or(0)
}

/// Whether `file` is still the inode linked at `path`
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_pid(mut file: &File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", pid)?;
    file.sync_all()
}

pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock or fail with [`BackupError::AlreadyRunning`]
    pub fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            debug!("Lock file {} was replaced while locking, retrying", self.path.display());
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("lock file {} keeps being replaced", self.path.display()),
        )
        .into())
    }

    /// `Ok(None)` when the file we locked was unlinked before we got it
    fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&self.path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(BackupError::AlreadyRunning {
                    pid: recorded_pid(&self.path),
                });
            }
            Err((_, errno)) => return Err(io::Error::from(errno).into()),
        };

        if !still_linked(&lock, &self.path)? {
            return Ok(None);
        }

        let mut content = String::new();
        (&*lock).read_to_string(&mut content)?;
        if let Some(pid) = parse_pid(&content) {
            // An owner that does not use flock still counts while it lives
            if process_alive(pid) {
                return Err(BackupError::AlreadyRunning { pid });
            }
        }
        if !content.trim().is_empty() {
            warn!(
                "Reclaiming stale lock file {} (recorded owner: {})",
                self.path.display(),
                content.trim()
            );
        }

        let pid = std::process::id();
        if let Err(e) = write_pid(&lock, pid) {
            let _ = std::fs::remove_file(&self.path);
            return Err(e.into());
        }
        info!("Acquired lock {} (pid {})", self.path.display(), pid);
        Ok(Some(LockGuard {
            path: self.path.clone(),
            lock: Some(lock),
        }))
    }

    /// Current lock state without touching it
    pub fn inspect(&self) -> Result<Option<LockInfo>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let created = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Local>::from);
        let pid = parse_pid(&content);
        Ok(Some(LockInfo {
            pid,
            created,
            alive: pid.map(process_alive).unwrap_or(false),
        }))
    }
}

/// Held lock. Released on [`LockGuard::release`] or drop.
pub struct LockGuard {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("held", &self.lock.is_some())
            .finish()
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        // Unlink before unlocking so a waiter on the old inode notices.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
        drop(lock);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
