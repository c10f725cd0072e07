//! Configuration for ciledger.
//!
//! A [`Config`] is loaded once at process start (TOML, every section
//! optional) and resolved against a workspace root into a
//! [`WorkspaceLayout`]. Components receive paths and settings through their
//! constructors; nothing reads ambient path state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default config file name looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = "ciledger.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CILEDGER_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub ledger: LedgerConfig,
    pub rotation: RotationConfig,
    pub cleanup: CleanupConfig,
    pub lock: LockConfig,
    pub logging: LoggingConfig,
}

/// File locations, relative paths resolved against the workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Ledger document.
    pub ledger_file: PathBuf,
    /// Rotation archive directory.
    pub archive_dir: PathBuf,
    /// Directory holding `<resource>.lock` files.
    pub lock_dir: PathBuf,
    /// Persisted budget state.
    pub budget_state: PathBuf,
    /// Directory of `*.jsonl` usage-event streams.
    pub usage_dir: PathBuf,
    /// Read-only pricing and limits configuration (JSON).
    pub pricing_config: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger_file: PathBuf::from("docs/ci-status/pipeline-log.json"),
            archive_dir: PathBuf::from("docs/ci-status/archive"),
            lock_dir: PathBuf::from(".claude"),
            budget_state: PathBuf::from(".claude/budget-state.json"),
            usage_dir: PathBuf::from("docs/ci-status/usage"),
            pricing_config: PathBuf::from("ci/config/model-pricing.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum retained activities; oldest are evicted first.
    pub max_entries: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::ledger::DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rotate once the ledger file exceeds this many bytes.
    pub max_size_bytes: u64,
    /// Rotate once the oldest activity is older than this many days.
    pub max_age_days: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 5 * 1024 * 1024,
            max_age_days: 30,
        }
    }
}

impl RotationConfig {
    #[must_use]
    pub fn max_age(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.max_age_days))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Files older than this are deleted by `rotate-logs`.
    pub retention_days: u32,
    /// Directories swept for stale artifacts. `None` means the archive dir
    /// plus the standard CI log directories.
    pub directories: Option<Vec<PathBuf>>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            directories: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Hard upper bound on waiting for a lock (milliseconds).
    pub timeout_ms: u64,
    /// First retry delay (milliseconds); doubles per attempt.
    pub base_backoff_ms: u64,
    /// Retry delay cap (milliseconds).
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown log format: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load using the standard resolution order:
    /// explicit path, `$CILEDGER_CONFIG`, `<workspace>/ciledger.toml`, defaults.
    ///
    /// Explicitly named files must exist; the workspace file is optional.
    pub fn load_resolved(explicit: Option<&Path>, workspace: &Path) -> Result<Self> {
        match resolve_config_path(explicit, workspace) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config");
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject settings that would break invariants.
    pub fn validate(&self) -> Result<()> {
        if self.ledger.max_entries == 0 {
            return Err(
                ConfigError::ValidationError("ledger.max_entries must be >= 1".into()).into(),
            );
        }
        if self.lock.timeout_ms == 0 {
            return Err(ConfigError::ValidationError("lock.timeout_ms must be > 0".into()).into());
        }
        if self.lock.base_backoff_ms == 0 || self.lock.base_backoff_ms > self.lock.max_backoff_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "lock backoff must satisfy 0 < base_backoff_ms ({}) <= max_backoff_ms ({})",
                self.lock.base_backoff_ms, self.lock.max_backoff_ms
            ))
            .into());
        }
        if self.rotation.max_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "rotation.max_size_bytes must be > 0".into(),
            )
            .into());
        }
        Ok(())
    }
}

/// Resolve which config file to read, if any.
pub fn resolve_config_path(explicit: Option<&Path>, workspace: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let candidate = workspace.join(CONFIG_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

/// Absolute file locations for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub ledger_file: PathBuf,
    pub archive_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub budget_state: PathBuf,
    pub usage_dir: PathBuf,
    pub pricing_config: PathBuf,
    pub cleanup_dirs: Vec<PathBuf>,
}

impl WorkspaceLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, paths: &PathsConfig, cleanup: &CleanupConfig) -> Self {
        let root = root.into();
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        let archive_dir = resolve(&paths.archive_dir);
        let cleanup_dirs = match &cleanup.directories {
            Some(dirs) => dirs.iter().map(|d| resolve(d)).collect(),
            None => vec![
                archive_dir.clone(),
                resolve(Path::new("docs/ci-status/build-logs")),
                resolve(Path::new("docs/ci-status/snapshots")),
                resolve(Path::new(".claude/hook-logs")),
            ],
        };
        Self {
            ledger_file: resolve(&paths.ledger_file),
            lock_dir: resolve(&paths.lock_dir),
            budget_state: resolve(&paths.budget_state),
            usage_dir: resolve(&paths.usage_dir),
            pricing_config: resolve(&paths.pricing_config),
            archive_dir,
            cleanup_dirs,
            root,
        }
    }

    #[must_use]
    pub fn from_config(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self::new(root, &config.paths, &config.cleanup)
    }
}
