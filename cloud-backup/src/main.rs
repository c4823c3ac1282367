//! Cloud Backup - Main entry point
//!
//! Performs one backup run per invocation; scheduling is left to cron or a
//! systemd timer. The exit status tells the scheduler how the run ended.

use anyhow::Context;
use clap::{Parser, Subcommand};
use cloud_backup::audit::AuditLog;
use cloud_backup::config::{self, Config, DEFAULT_CONFIG_PATH};
use cloud_backup::daemon::{wait_for_signal, LockManager, ShutdownSignal};
use cloud_backup::executor::{Listing, Pipeline};
use cloud_backup::fs::walker::{calculate_total_size, WalkOptions};
use cloud_backup::utils::{self, format::format_bytes, BackupError};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Perform one backup run (default)
    Run,
    /// Run the preflight checks without producing anything
    Check,
    /// List backups of this host on the remote
    List,
    /// Show lock state and recent audit entries
    Status,
    /// Inspect or edit the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration with secrets masked
    Show,
    /// Set a single key, e.g. `retention.keep_daily 7`
    Set { key: String, value: String },
}

enum Finished {
    Completed(cloud_backup::Result<()>),
    Interrupted(ShutdownSignal),
}

fn exit_with(e: &BackupError) -> ExitCode {
    ExitCode::from(e.exit_code())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(Command::Config {
        action: ConfigAction::Set { key, value },
    }) = &args.command
    {
        return set_config(&args.config, key, value);
    }

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cloud-backup: {}", e);
            return exit_with(&e);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("cloud-backup: failed to initialize logging: {}", e);
    }

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(config),
        Command::List => list(config).await,
        Command::Status => status(&config),
        Command::Config { .. } => {
            print!("{}", config.redacted_summary());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            exit_with(&e)
        }
    }
}

fn open_audit(config: &Config) -> cloud_backup::Result<AuditLog> {
    AuditLog::open(&config.log_file).map_err(|e| {
        BackupError::Config(format!("audit log {}: {}", config.log_file.display(), e))
    })
}

async fn run(config: Config) -> cloud_backup::Result<()> {
    tracing::info!(
        "Starting cloud-backup v{} ({} strategy, host {})",
        env!("CARGO_PKG_VERSION"),
        config.strategy,
        config.host
    );

    let audit = open_audit(&config)?;
    let mut pipeline = Pipeline::from_config(config, audit)?;

    let finished = tokio::select! {
        result = pipeline.run() => Finished::Completed(result.map(|_| ())),
        signal = wait_for_signal() => Finished::Interrupted(signal),
    };

    match finished {
        Finished::Completed(result) => result,
        Finished::Interrupted(signal) => {
            tracing::warn!("Received {}, abandoning run", signal.name());
            let e = pipeline.report_interrupted(signal).await;
            // Archiving may still be busy on the blocking pool; do not wait for it.
            std::process::exit(i32::from(e.exit_code()));
        }
    }
}

fn check(config: Config) -> cloud_backup::Result<()> {
    let walk = WalkOptions {
        follow_links: false,
        exclude_patterns: config.exclude.clone(),
        exclude_paths: vec![config.work_dir.clone()],
    };
    let audit = open_audit(&config)?;
    let pipeline = Pipeline::from_config(config, audit)?;
    let report = pipeline.check()?;

    println!(
        "free space on {}: {}",
        report.checked_path.display(),
        format_bytes(report.free_bytes)
    );
    for source in &report.valid_sources {
        match calculate_total_size(source, &walk) {
            Ok(size) => println!("source  {}  {}", source.display(), format_bytes(size)),
            Err(e) => println!("source  {}  (size unknown: {})", source.display(), e),
        }
    }
    for missing in &report.missing_sources {
        println!("missing {}", missing.display());
    }
    Ok(())
}

async fn list(config: Config) -> cloud_backup::Result<()> {
    let audit = open_audit(&config)?;
    let pipeline = Pipeline::from_config(config, audit)?;

    match pipeline.list().await? {
        Listing::Snapshots(snapshots) => {
            for snapshot in snapshots {
                let paths: Vec<String> =
                    snapshot.paths.iter().map(|p| p.display().to_string()).collect();
                println!(
                    "{}  {}  {}  {}",
                    snapshot.short_id,
                    snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.hostname,
                    paths.join(",")
                );
            }
        }
        Listing::Artifacts(artifacts) => {
            for (artifact, size) in artifacts {
                println!("{}  {:>10}  {}", artifact.timestamp, format_bytes(size), artifact.name);
            }
        }
    }
    Ok(())
}

fn status(config: &Config) -> cloud_backup::Result<()> {
    match LockManager::new(&config.lock_file).inspect()? {
        Some(info) => {
            let pid = info.pid.map_or_else(|| "unknown".to_string(), |p| p.to_string());
            let since = info
                .created
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let state = if info.alive { "running" } else { "stale" };
            println!("lock: {} (pid {}, since {})", state, pid, since);
        }
        None => println!("lock: free"),
    }

    let audit = open_audit(config)?;
    let recent = audit.tail(10)?;
    if recent.is_empty() {
        println!("no audit entries in {}", audit.path().display());
    } else {
        println!("recent audit entries ({}):", audit.path().display());
        for line in recent {
            println!("  {}", line);
        }
    }
    Ok(())
}

fn set_config(path: &Path, key: &str, value: &str) -> ExitCode {
    let result = config::set_value(path, key, value)
        .with_context(|| format!("failed to update {}", path.display()));
    match result {
        Ok(_) => {
            let shown = if config::is_secret_key(key) {
                config::mask_secret(&SecretString::from(value.to_string()))
            } else {
                value.to_string()
            };
            println!("{} = {}", key, shown);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("cloud-backup: {:#}", e);
            ExitCode::from(78)
        }
    }
}
