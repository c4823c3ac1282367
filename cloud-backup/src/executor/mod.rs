//! Backup pipeline - Orchestrates one backup run.
//!
//! Lock → Preflight → Produce → (Transport, Full only) → Retain → Report.
//! The lock is held by a guard local to [`Pipeline::run`], so it is released
//! on every exit path, including the run future being dropped on a signal.

pub mod full;
pub mod incremental;

use crate::artifact::{parse_artifact_name, ArtifactName};
use crate::audit::AuditLog;
use crate::config::{Config, Strategy};
use crate::daemon::{LockManager, ShutdownSignal};
use crate::engine::{ResticEngine, SnapshotEngine, SnapshotInfo, SnapshotSummary};
use crate::fs::preflight::{self, PreflightReport};
use crate::fs::walker::WalkOptions;
use crate::notify::{self, message, Notifier};
use crate::retention;
use crate::transfer::{RcloneStore, RemoteStore, RetryPolicy};
use crate::utils::format::format_duration;
use crate::utils::{BackupError, Result};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

/// Where a run currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Locked,
    PreflightOk,
    Produced,
    Transported,
    Retained,
    Reported { success: bool },
}

impl PipelineState {
    /// Whether `next` may follow `self`
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Locked) => true,
            (Locked, PreflightOk) => true,
            (PreflightOk, Produced) => true,
            (Produced, Transported) | (Produced, Retained) => true,
            (Transported, Retained) => true,
            (Retained, Reported { success: true }) => true,
            (Reported { .. }, Idle) => true,
            // Any fatal condition reports straight away
            (_, Reported { success: false }) => !matches!(self, Reported { .. }),
            _ => false,
        }
    }
}

/// Strategy-specific collaborator
pub enum Backend {
    Snapshot(Box<dyn SnapshotEngine>),
    Archive(Box<dyn RemoteStore>),
}

impl Backend {
    fn strategy(&self) -> Strategy {
        match self {
            Backend::Snapshot(_) => Strategy::Incremental,
            Backend::Archive(_) => Strategy::Full,
        }
    }
}

/// Strategy-specific outcome of a successful run
#[derive(Debug, Clone)]
pub enum RunDetails {
    Snapshot {
        summary: SnapshotSummary,
        repository_size: Option<u64>,
    },
    Artifact {
        name: String,
        size: u64,
        files: u64,
        skipped: usize,
    },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub host: String,
    pub strategy: Strategy,
    pub missing_sources: Vec<PathBuf>,
    pub details: RunDetails,
    /// Snapshots or artifacts left after retention, when known
    pub retained: Option<usize>,
    pub duration_secs: u64,
}

/// What `list` shows for each strategy
#[derive(Debug, Clone)]
pub enum Listing {
    Snapshots(Vec<SnapshotInfo>),
    Artifacts(Vec<(ArtifactName, u64)>),
}

/// Current state plus the path taken to reach it
#[derive(Debug)]
struct StateTracker {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    /// Whether the current run got past lock acquisition
    fn lock_acquired(&self) -> bool {
        self.history.contains(&PipelineState::Locked)
    }

    fn advance(&mut self, next: PipelineState) {
        if !self.state.can_advance_to(next) {
            error!("Invalid pipeline transition {:?} -> {:?}", self.state, next);
        }
        debug!("Pipeline state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }
}

pub struct Pipeline {
    config: Config,
    backend: Backend,
    notifier: Box<dyn Notifier>,
    audit: AuditLog,
    tracker: StateTracker,
}

impl Pipeline {
    /// Wire up the production collaborators for `config`
    pub fn from_config(config: Config, audit: AuditLog) -> Result<Self> {
        let backend = match config.strategy {
            Strategy::Incremental => Backend::Snapshot(Box::new(ResticEngine::new(
                &config.tools.restic,
                &config.tools.rclone,
                &config.destination,
                config.passphrase.clone(),
            ))),
            Strategy::Full => Backend::Archive(Box::new(RcloneStore::new(&config.tools.rclone))),
        };
        let notifier = notify::from_config(&config.notify);
        Self::new(config, backend, notifier, audit)
    }

    pub fn new(
        config: Config,
        backend: Backend,
        notifier: Box<dyn Notifier>,
        audit: AuditLog,
    ) -> Result<Self> {
        if backend.strategy() != config.strategy {
            return Err(BackupError::Config(format!(
                "{} strategy configured but {} backend supplied",
                config.strategy,
                backend.strategy()
            )));
        }
        Ok(Self {
            config,
            backend,
            notifier,
            audit,
            tracker: StateTracker::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.tracker.state
    }

    /// States visited since the last run started
    pub fn history(&self) -> &[PipelineState] {
        &self.tracker.history
    }

    fn space_path(&self) -> PathBuf {
        match self.config.strategy {
            Strategy::Full => self.config.work_dir.clone(),
            Strategy::Incremental => self.config.reference_mount.clone(),
        }
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            follow_links: false,
            exclude_patterns: self.config.exclude.clone(),
            exclude_paths: Vec::new(),
        }
    }

    /// Execute one complete run
    pub async fn run(&mut self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, host = %self.config.host);

        async move {
            let started = Instant::now();
            self.tracker = StateTracker::new();
            self.audit.info(format!(
                "Backup started (host {}, {} strategy)",
                self.config.host, self.config.strategy
            ));

            let mut guard = match LockManager::new(&self.config.lock_file).acquire() {
                Ok(guard) => guard,
                Err(e) => {
                    self.report_failure(&e).await;
                    self.tracker.advance(PipelineState::Idle);
                    return Err(e);
                }
            };
            self.tracker.advance(PipelineState::Locked);

            let result = self.execute(run_id, started).await;
            match &result {
                Ok(report) => self.report_success(report).await,
                Err(e) => {
                    if self.config.strategy == Strategy::Full {
                        full::discard_work_dir(&self.config.work_dir);
                    }
                    self.report_failure(e).await;
                }
            }

            guard.release();
            self.tracker.advance(PipelineState::Idle);
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self, run_id: Uuid, started: Instant) -> Result<RunReport> {
        let report = preflight::check(&self.space_path(), self.config.min_free_bytes, &self.config.sources)?;
        for missing in &report.missing_sources {
            self.audit
                .warning(format!("Source path does not exist, skipping: {}", missing.display()));
        }
        self.tracker.advance(PipelineState::PreflightOk);

        let (details, retained) = match self.config.strategy {
            Strategy::Incremental => self.run_incremental(&report).await?,
            Strategy::Full => self.run_full(&report).await?,
        };

        Ok(RunReport {
            run_id,
            host: self.config.host.clone(),
            strategy: self.config.strategy,
            missing_sources: report.missing_sources,
            details,
            retained,
            duration_secs: started.elapsed().as_secs(),
        })
    }

    async fn run_incremental(&mut self, report: &PreflightReport) -> Result<(RunDetails, Option<usize>)> {
        let Backend::Snapshot(engine) = &self.backend else {
            return Err(BackupError::Config("snapshot engine not available".into()));
        };
        let engine = engine.as_ref();

        let summary = incremental::produce(
            engine,
            &report.valid_sources,
            &self.config.host,
            &self.config.exclude,
            &self.audit,
        )
        .await?;
        self.tracker.advance(PipelineState::Produced);

        let retained =
            retention::enforce_snapshots(engine, &self.config.host, &self.config.retention, &self.audit).await;
        let repository_size = incremental::repository_size(engine, &self.audit).await;
        self.tracker.advance(PipelineState::Retained);

        Ok((
            RunDetails::Snapshot {
                summary,
                repository_size,
            },
            retained,
        ))
    }

    async fn run_full(&mut self, report: &PreflightReport) -> Result<(RunDetails, Option<usize>)> {
        let Backend::Archive(store) = &self.backend else {
            return Err(BackupError::Config("remote store not available".into()));
        };
        let store = store.as_ref();
        let location = self.config.remote_location()?;

        let request = full::ProduceRequest {
            host: self.config.host.clone(),
            sources: report.valid_sources.clone(),
            walk: self.walk_options(),
            work_dir: self.config.work_dir.clone(),
            passphrase: self.config.passphrase.clone(),
        };
        let artifact = full::produce(request, &self.audit).await?;
        self.tracker.advance(PipelineState::Produced);

        let policy = RetryPolicy::from_config(&self.config.transfer);
        let size = full::transport(store, &location, &artifact, &policy, &self.audit).await?;
        self.tracker.advance(PipelineState::Transported);

        let outcome = retention::enforce_artifacts(
            store,
            &location,
            &self.config.host,
            self.config.retention.max_artifacts,
            &self.audit,
        )
        .await;
        self.tracker.advance(PipelineState::Retained);

        Ok((
            RunDetails::Artifact {
                name: artifact.name,
                size,
                files: artifact.stats.files,
                skipped: artifact.stats.skipped.len(),
            },
            outcome.map(|o| o.retained),
        ))
    }

    async fn report_success(&mut self, report: &RunReport) {
        self.tracker.advance(PipelineState::Reported { success: true });
        self.audit.info(format!(
            "Backup completed successfully in {}",
            format_duration(report.duration_secs)
        ));
        self.notifier
            .notify(&message::success_message(report), false)
            .await;
    }

    async fn report_failure(&mut self, e: &BackupError) {
        // An interruption can land while an earlier failure is being reported
        if !matches!(self.tracker.state, PipelineState::Reported { .. }) {
            self.tracker.advance(PipelineState::Reported { success: false });
        }
        self.audit.failure(format!("Backup failed: {}", e));
        self.notifier
            .notify(&message::failure_message(&self.config.host, e), true)
            .await;
    }

    /// Record a run that was cut short by `signal`.
    ///
    /// Call after the [`Pipeline::run`] future was dropped; the lock is
    /// already gone with it.
    pub async fn report_interrupted(&mut self, signal: ShutdownSignal) -> BackupError {
        let e = BackupError::Interrupted(signal.name());
        // Without the lock the working directory belongs to another run.
        if self.config.strategy == Strategy::Full && self.tracker.lock_acquired() {
            full::discard_work_dir(&self.config.work_dir);
        }
        self.report_failure(&e).await;
        self.tracker.advance(PipelineState::Idle);
        e
    }

    /// Run only the preflight checks, under a transient lock
    pub fn check(&self) -> Result<PreflightReport> {
        let mut guard = LockManager::new(&self.config.lock_file).acquire()?;
        let report = preflight::check(&self.space_path(), self.config.min_free_bytes, &self.config.sources);
        guard.release();
        report
    }

    /// Backups of this host currently on the remote
    pub async fn list(&self) -> Result<Listing> {
        match &self.backend {
            Backend::Snapshot(engine) => Ok(Listing::Snapshots(engine.snapshots(&self.config.host).await?)),
            Backend::Archive(store) => {
                let location = self.config.remote_location()?;
                let mut artifacts: Vec<(ArtifactName, u64)> = store
                    .list_dir(&location)
                    .await?
                    .into_iter()
                    .filter_map(|e| parse_artifact_name(&self.config.host, &e.name).map(|n| (n, e.size)))
                    .collect();
                artifacts.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Listing::Artifacts(artifacts))
            }
        }
    }
}
