//! Configuration management for the backup pipeline.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`CLOUD_BACKUP_<KEY>`, nested keys joined with `__`). The resulting
//! [`Config`] is read-only for the lifetime of a run and is handed to every
//! component explicitly.

use crate::transfer::RemoteLocation;
use crate::utils::{BackupError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CLOUD_BACKUP";

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cloud-backup/config.toml";

/// Artifact-producing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Deduplicated snapshots managed by the external snapshot engine
    Incremental,
    /// Local compressed, encrypted archive uploaded to remote storage
    Full,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Incremental => write!(f, "incremental"),
            Strategy::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host identifier used for tagging and artifact naming (sanitized)
    #[serde(default = "default_host", deserialize_with = "deserialize_host")]
    pub host: String,

    pub strategy: Strategy,

    /// Source paths, in order
    pub sources: Vec<PathBuf>,

    /// Entry names left out of every source tree
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Remote destination, `remote-name:path`
    pub destination: String,

    /// Encryption passphrase
    #[serde(deserialize_with = "deserialize_secret")]
    pub passphrase: SecretString,

    /// Working directory for staging archives (Full strategy)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Audit log file
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Lock file location
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Minimum free space required before a run starts
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Filesystem checked for free space in incremental mode
    #[serde(default = "default_reference_mount")]
    pub reference_mount: PathBuf,

    #[serde(default)]
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Retention policy. Zero disables a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last: u32,
    #[serde(default = "default_keep_daily")]
    pub keep_daily: u32,
    #[serde(default = "default_keep_weekly")]
    pub keep_weekly: u32,
    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: u32,
    #[serde(default)]
    pub keep_yearly: u32,

    /// Full strategy: number of newest artifacts kept on the remote
    #[serde(default = "default_max_artifacts")]
    pub max_artifacts: u32,
}

/// Incremental retention tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionTier {
    Last,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionPolicy {
    /// The enabled incremental tiers, in a stable order
    pub fn active_tiers(&self) -> Vec<(RetentionTier, u32)> {
        [
            (RetentionTier::Last, self.keep_last),
            (RetentionTier::Daily, self.keep_daily),
            (RetentionTier::Weekly, self.keep_weekly),
            (RetentionTier::Monthly, self.keep_monthly),
            (RetentionTier::Yearly, self.keep_yearly),
        ]
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .collect()
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: 0,
            keep_daily: default_keep_daily(),
            keep_weekly: default_keep_weekly(),
            keep_monthly: default_keep_monthly(),
            keep_yearly: 0,
            max_artifacts: default_max_artifacts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Bot token embedded in the endpoint URL
    #[serde(default, deserialize_with = "deserialize_optional_secret")]
    pub bot_token: Option<SecretString>,

    #[serde(default)]
    pub chat_id: Option<String>,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Upper bound for a single notification request
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl NotifyConfig {
    /// Token and chat id, when both are present
    pub fn credentials(&self) -> Option<(&SecretString, &str)> {
        let token = self.bot_token.as_ref()?;
        let chat_id = self.chat_id.as_deref().filter(|c| !c.trim().is_empty())?;
        Some((token, chat_id))
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_api_base(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// External tool executables
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_restic")]
    pub restic: PathBuf,

    #[serde(default = "default_rclone")]
    pub rclone: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            restic: default_restic(),
            rclone: default_rclone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| sanitize_host(&h))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/tmp/cloud-backup")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/cloud-backup.log")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/cloud-backup.lock")
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_reference_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_keep_daily() -> u32 {
    7
}

fn default_keep_weekly() -> u32 {
    4
}

fn default_keep_monthly() -> u32 {
    6
}

fn default_max_artifacts() -> u32 {
    7
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_restic() -> PathBuf {
    PathBuf::from("restic")
}

fn default_rclone() -> PathBuf {
    PathBuf::from("rclone")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn deserialize_host<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let host = sanitize_host(&raw);
    if host.is_empty() {
        return Err(serde::de::Error::custom(format!(
            "host '{}' contains no usable characters",
            raw
        )));
    }
    Ok(host)
}

fn deserialize_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

fn deserialize_optional_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()).map(SecretString::from))
}

/// Lowercase, replace anything outside `[a-z0-9-]` with `-`, collapse runs
/// and trim hyphens at both ends.
pub fn sanitize_host(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Mask a secret for display. Never shows more than two leading and two
/// trailing characters.
pub fn mask_secret(secret: &SecretString) -> String {
    let exposed = secret.expose_secret();
    let chars: Vec<char> = exposed.chars().collect();
    if chars.len() <= 8 {
        "****".to_string()
    } else {
        let prefix: String = chars[..2].iter().collect();
        let suffix: String = chars[chars.len() - 2..].iter().collect();
        format!("{prefix}****{suffix}")
    }
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(BackupError::Config("no source paths configured".into()));
        }
        RemoteLocation::parse(&self.destination)?;
        if self.passphrase.expose_secret().is_empty() {
            return Err(BackupError::Config("passphrase must not be empty".into()));
        }
        if self.transfer.max_attempts == 0 {
            return Err(BackupError::Config(
                "transfer.max_attempts must be at least 1".into(),
            ));
        }
        if self.notify.bot_token.is_some() != self.notify.chat_id.is_some() {
            tracing::warn!("Notifications need both notify.bot_token and notify.chat_id; disabled");
        }
        Ok(())
    }

    /// Destination split into remote name and path
    pub fn remote_location(&self) -> Result<RemoteLocation> {
        RemoteLocation::parse(&self.destination)
    }

    /// Human-readable dump with secrets masked
    pub fn redacted_summary(&self) -> String {
        let mut out = String::new();
        let sources: Vec<String> = self.sources.iter().map(|s| s.display().to_string()).collect();
        let _ = writeln!(out, "host            = {}", self.host);
        let _ = writeln!(out, "strategy        = {}", self.strategy);
        let _ = writeln!(out, "sources         = {}", sources.join(", "));
        if !self.exclude.is_empty() {
            let _ = writeln!(out, "exclude         = {}", self.exclude.join(", "));
        }
        let _ = writeln!(out, "destination     = {}", self.destination);
        let _ = writeln!(out, "passphrase      = {}", mask_secret(&self.passphrase));
        let _ = writeln!(out, "work_dir        = {}", self.work_dir.display());
        let _ = writeln!(out, "log_file        = {}", self.log_file.display());
        let _ = writeln!(out, "lock_file       = {}", self.lock_file.display());
        let _ = writeln!(out, "min_free_bytes  = {}", self.min_free_bytes);
        match self.strategy {
            Strategy::Incremental => {
                let r = &self.retention;
                let _ = writeln!(
                    out,
                    "retention       = last {} / daily {} / weekly {} / monthly {} / yearly {}",
                    r.keep_last, r.keep_daily, r.keep_weekly, r.keep_monthly, r.keep_yearly
                );
            }
            Strategy::Full => {
                let _ = writeln!(out, "retention       = keep {} newest", self.retention.max_artifacts);
            }
        }
        let token = self
            .notify
            .bot_token
            .as_ref()
            .map(mask_secret)
            .unwrap_or_else(|| "(unset)".to_string());
        let _ = writeln!(out, "notify.token    = {}", token);
        let _ = writeln!(
            out,
            "notify.chat_id  = {}",
            self.notify.chat_id.as_deref().unwrap_or("(unset)")
        );
        out
    }
}

/// Keys accepted by the single-field edit path
const EDITABLE_KEYS: &[&str] = &[
    "host",
    "strategy",
    "sources",
    "exclude",
    "destination",
    "passphrase",
    "work_dir",
    "log_file",
    "lock_file",
    "min_free_bytes",
    "reference_mount",
    "retention.keep_last",
    "retention.keep_daily",
    "retention.keep_weekly",
    "retention.keep_monthly",
    "retention.keep_yearly",
    "retention.max_artifacts",
    "notify.bot_token",
    "notify.chat_id",
    "notify.api_base",
    "notify.timeout_secs",
    "transfer.max_attempts",
    "transfer.retry_delay_secs",
    "tools.restic",
    "tools.rclone",
    "log.level",
];

const NUMERIC_KEYS: &[&str] = &[
    "min_free_bytes",
    "retention.keep_last",
    "retention.keep_daily",
    "retention.keep_weekly",
    "retention.keep_monthly",
    "retention.keep_yearly",
    "retention.max_artifacts",
    "notify.timeout_secs",
    "transfer.max_attempts",
    "transfer.retry_delay_secs",
];

const SECRET_KEYS: &[&str] = &["passphrase", "notify.bot_token"];

/// Whether a key holds a secret that must not be echoed
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.contains(&key)
}

fn parse_edit_value(key: &str, raw: &str) -> anyhow::Result<toml_edit::Item> {
    if key == "sources" || key == "exclude" {
        let items: toml_edit::Array = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        return Ok(toml_edit::value(items));
    }
    if NUMERIC_KEYS.contains(&key) {
        let n: u64 = raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} expects a non-negative integer, got '{}'", key, raw))?;
        let n = i64::try_from(n).map_err(|_| anyhow::anyhow!("{} is out of range", key))?;
        return Ok(toml_edit::value(n));
    }
    Ok(toml_edit::value(raw))
}

/// Update a single key of the configuration file.
///
/// The edited document is fully re-validated before it replaces the file, so
/// a rejected edit leaves the stored configuration untouched. Comments and
/// layout of the rest of the file are kept as written.
pub fn set_value(path: &Path, key: &str, raw_value: &str) -> anyhow::Result<Config> {
    if !EDITABLE_KEYS.contains(&key) {
        anyhow::bail!("unknown configuration key '{}'", key);
    }

    let content = std::fs::read_to_string(path)?;
    let mut doc: toml_edit::DocumentMut = content.parse()?;
    let mut item = parse_edit_value(key, raw_value)?;

    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts.pop().ok_or_else(|| anyhow::anyhow!("empty key"))?;
    let mut table = doc.as_table_mut();
    for part in parts {
        table = table
            .entry(part)
            .or_insert_with(toml_edit::table)
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a table", part))?;
    }

    // Keep a trailing comment on the replaced line
    let decor = table
        .get(leaf)
        .and_then(toml_edit::Item::as_value)
        .map(|v| v.decor().clone());
    if let (Some(decor), Some(value)) = (decor, item.as_value_mut()) {
        *value.decor_mut() = decor;
    }
    table.insert(leaf, item);

    let rendered = doc.to_string();
    let config = Config::from_toml_str(&rendered)?;
    write_atomic(path, &rendered)?;
    Ok(config)
}

/// Replace `path` with `content` through a sibling temp file that is
/// owner-only from creation.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("toml.tmp");
    // A leftover from an earlier crash may carry wider permissions
    let _ = std::fs::remove_file(&tmp);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let written = options
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&tmp, path));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}
