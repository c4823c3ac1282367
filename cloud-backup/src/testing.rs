//! In-memory stand-ins for the external collaborators, shared by unit tests.

use crate::config::{
    Config, LogConfig, NotifyConfig, RetentionPolicy, Strategy, ToolsConfig, TransferConfig,
};
use crate::engine::{RepoStats, SnapshotEngine, SnapshotInfo, SnapshotSummary};
use crate::notify::Notifier;
use crate::transfer::{RemoteEntry, RemoteLocation, RemoteStore};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_PASSPHRASE: &str = "test passphrase";

/// Configuration rooted entirely inside `dir`
pub fn test_config(dir: &Path, strategy: Strategy, sources: Vec<PathBuf>) -> Config {
    Config {
        host: "testhost".to_string(),
        strategy,
        sources,
        exclude: Vec::new(),
        destination: "remote:backups".to_string(),
        passphrase: SecretString::from(TEST_PASSPHRASE.to_string()),
        work_dir: dir.join("work"),
        log_file: dir.join("audit.log"),
        lock_file: dir.join("run/backup.lock"),
        min_free_bytes: 0,
        reference_mount: dir.to_path_buf(),
        retention: RetentionPolicy::default(),
        notify: NotifyConfig::default(),
        transfer: TransferConfig {
            max_attempts: 3,
            retry_delay_secs: 0,
        },
        tools: ToolsConfig::default(),
        log: LogConfig::default(),
    }
}

#[derive(Default)]
struct StoreState {
    remotes: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
    copy_attempts: BTreeMap<String, usize>,
    truncate_next: usize,
    fail_copies: usize,
    fail_copies_of: HashSet<String>,
    fail_deletes_of: HashSet<String>,
    fail_list: bool,
}

/// Remote store holding file contents in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn with_remotes(remotes: &[&str]) -> Self {
        let store = Self::default();
        store.lock().remotes = remotes.iter().map(|r| r.to_string()).collect();
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, remote_file: &str, data: &[u8]) {
        self.lock().files.insert(remote_file.to_string(), data.to_vec());
    }

    pub fn contains(&self, remote_file: &str) -> bool {
        self.lock().files.contains_key(remote_file)
    }

    pub fn get(&self, remote_file: &str) -> Option<Vec<u8>> {
        self.lock().files.get(remote_file).cloned()
    }

    /// All stored paths, sorted
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Total copy calls
    pub fn copy_attempts(&self) -> usize {
        self.lock().copy_attempts.values().sum()
    }

    pub fn copy_attempts_for(&self, remote_file: &str) -> usize {
        self.lock().copy_attempts.get(remote_file).copied().unwrap_or(0)
    }

    /// The next `n` copies store only half the data
    pub fn truncate_next_uploads(&self, n: usize) {
        self.lock().truncate_next = n;
    }

    /// The next `n` copies fail outright
    pub fn fail_next_copies(&self, n: usize) {
        self.lock().fail_copies = n;
    }

    /// Every copy to files whose name ends with `suffix` fails
    pub fn fail_copies_ending_with(&self, suffix: &str) {
        self.lock().fail_copies_of.insert(suffix.to_string());
    }

    pub fn fail_deletes_of(&self, remote_file: &str) {
        self.lock().fail_deletes_of.insert(remote_file.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.lock().fail_list = fail;
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_remotes(&self) -> Result<Vec<String>> {
        Ok(self.lock().remotes.clone())
    }

    async fn list_dir(&self, location: &RemoteLocation) -> Result<Vec<RemoteEntry>> {
        let state = self.lock();
        if state.fail_list {
            return Err(BackupError::Transport("listing failed".into()));
        }
        let prefix = location.file("");
        Ok(state
            .files
            .iter()
            .filter_map(|(path, data)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| RemoteEntry {
                    name: name.to_string(),
                    size: data.len() as u64,
                })
            })
            .collect())
    }

    async fn copy(&self, local: &Path, remote_file: &str) -> Result<()> {
        let data = std::fs::read(local)?;
        let mut state = self.lock();
        *state.copy_attempts.entry(remote_file.to_string()).or_default() += 1;

        if state.fail_copies_of.iter().any(|s| remote_file.ends_with(s.as_str())) {
            return Err(BackupError::Transport("copy rejected".into()));
        }
        if state.fail_copies > 0 {
            state.fail_copies -= 1;
            return Err(BackupError::Transport("connection reset".into()));
        }
        let stored = if state.truncate_next > 0 {
            state.truncate_next -= 1;
            data[..data.len() / 2].to_vec()
        } else {
            data
        };
        state.files.insert(remote_file.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, remote_file: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_deletes_of.contains(remote_file) {
            return Err(BackupError::Transport("delete refused".into()));
        }
        state
            .files
            .remove(remote_file)
            .map(|_| ())
            .ok_or_else(|| BackupError::Transport(format!("{} not found", remote_file)))
    }

    async fn size(&self, remote_file: &str) -> Result<u64> {
        self.lock()
            .files
            .get(remote_file)
            .map(|d| d.len() as u64)
            .ok_or_else(|| BackupError::Transport(format!("{} not found", remote_file)))
    }
}

#[derive(Default)]
struct EngineState {
    initialized: bool,
    init_calls: usize,
    forget_calls: usize,
    backups: Vec<(Vec<PathBuf>, String, Vec<String>)>,
    snapshots: Vec<SnapshotInfo>,
    fail_init: bool,
    fail_backup: bool,
    fail_forget: bool,
    hang_backup: bool,
}

/// Snapshot engine that records calls and keeps snapshots in memory
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn initialized(self) -> Self {
        self.lock().initialized = true;
        self
    }

    pub fn init_calls(&self) -> usize {
        self.lock().init_calls
    }

    pub fn forget_calls(&self) -> usize {
        self.lock().forget_calls
    }

    /// Sources, host tag and excludes of every backup call
    pub fn backups(&self) -> Vec<(Vec<PathBuf>, String, Vec<String>)> {
        self.lock().backups.clone()
    }

    pub fn fail_init(&self, fail: bool) {
        self.lock().fail_init = fail;
    }

    pub fn fail_backup(&self, fail: bool) {
        self.lock().fail_backup = fail;
    }

    pub fn fail_forget(&self, fail: bool) {
        self.lock().fail_forget = fail;
    }

    /// Backups never complete
    pub fn hang_backup(&self, hang: bool) {
        self.lock().hang_backup = hang;
    }
}

#[async_trait]
impl SnapshotEngine for FakeEngine {
    async fn probe(&self) -> Result<bool> {
        Ok(self.lock().initialized)
    }

    async fn init(&self) -> Result<()> {
        let mut state = self.lock();
        state.init_calls += 1;
        if state.fail_init {
            return Err(BackupError::Producer("repository init failed".into()));
        }
        state.initialized = true;
        Ok(())
    }

    async fn backup(&self, sources: &[PathBuf], host: &str, excludes: &[String]) -> Result<SnapshotSummary> {
        let hang = {
            let mut state = self.lock();
            state
                .backups
                .push((sources.to_vec(), host.to_string(), excludes.to_vec()));
            if state.fail_backup {
                return Err(BackupError::Producer("restic backup failed: exit status 1".into()));
            }
            state.hang_backup
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        let id = format!("{:08x}", state.snapshots.len() + 1);
        state.snapshots.push(SnapshotInfo {
            id: id.clone(),
            short_id: id.clone(),
            time: Utc::now().fixed_offset(),
            hostname: host.to_string(),
            tags: vec![host.to_string()],
            paths: sources.to_vec(),
        });
        Ok(SnapshotSummary {
            snapshot_id: id,
            files_new: sources.len() as u64,
            data_added: 1024,
            total_bytes_processed: 4096,
            ..Default::default()
        })
    }

    async fn snapshots(&self, host: &str) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.tags.iter().any(|t| t == host))
            .cloned()
            .collect())
    }

    async fn forget(&self, _host: &str, _policy: &RetentionPolicy) -> Result<()> {
        let mut state = self.lock();
        state.forget_calls += 1;
        if state.fail_forget {
            return Err(BackupError::Producer("restic forget failed".into()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<RepoStats> {
        let state = self.lock();
        Ok(RepoStats {
            total_size: 4096 * state.snapshots.len() as u64,
            snapshots_count: state.snapshots.len() as u64,
        })
    }
}

/// Notifier that keeps every message; clones share the record
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<(String, bool)>>>,
    delay: Duration,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each send records its message, then stalls for `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<(String, bool)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, is_error: bool) {
        self.messages
            .lock()
            .unwrap()
            .push((message.to_string(), is_error));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Sorted entry names of a `.tar.gz` archive
pub fn tar_entry_names(archive: &Path) -> Vec<String> {
    let file = std::fs::File::open(archive).unwrap();
    let mut reader = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut names: Vec<String> = reader
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// Lets a test keep a handle on collaborators owned by a pipeline.

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn list_remotes(&self) -> Result<Vec<String>> {
        (**self).list_remotes().await
    }

    async fn list_dir(&self, location: &RemoteLocation) -> Result<Vec<RemoteEntry>> {
        (**self).list_dir(location).await
    }

    async fn copy(&self, local: &Path, remote_file: &str) -> Result<()> {
        (**self).copy(local, remote_file).await
    }

    async fn delete(&self, remote_file: &str) -> Result<()> {
        (**self).delete(remote_file).await
    }

    async fn size(&self, remote_file: &str) -> Result<u64> {
        (**self).size(remote_file).await
    }
}

#[async_trait]
impl<T: SnapshotEngine + ?Sized> SnapshotEngine for Arc<T> {
    async fn probe(&self) -> Result<bool> {
        (**self).probe().await
    }

    async fn init(&self) -> Result<()> {
        (**self).init().await
    }

    async fn backup(&self, sources: &[PathBuf], host: &str, excludes: &[String]) -> Result<SnapshotSummary> {
        (**self).backup(sources, host, excludes).await
    }

    async fn snapshots(&self, host: &str) -> Result<Vec<SnapshotInfo>> {
        (**self).snapshots(host).await
    }

    async fn forget(&self, host: &str, policy: &RetentionPolicy) -> Result<()> {
        (**self).forget(host, policy).await
    }

    async fn stats(&self) -> Result<RepoStats> {
        (**self).stats().await
    }
}
