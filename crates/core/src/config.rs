//! TOML-based configuration for ContentSync.
//!
//! The configuration covers where sync state is stored, the log level, which
//! resolution strategy is used when nothing else can auto-resolve, and the
//! staleness policy for detecting interrupted synchronizations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::resolution::strategies::BUILTIN_STRATEGY_NAMES;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Persistence settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Conflict resolution settings.
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Sync bookkeeping settings.
    #[serde(default)]
    pub sync: SyncConfig,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where the sync-state database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for persistent data.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/contentsync")
}
fn default_database_file() -> String {
    "contentsync.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
        }
    }
}

impl StoreConfig {
    /// Full path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Conflict resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Strategy used when no registered strategy can auto-resolve a conflict.
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
}

fn default_strategy() -> String {
    "manual_merge".into()
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Sync bookkeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// A content type left in `syncing` longer than this is treated as
    /// interrupted.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    900
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

impl SyncConfig {
    /// The staleness window as a `chrono` duration.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs.min(i64::MAX as u64) as i64)
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.database_file.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "store.database_file".into(),
                detail: "database file name must not be empty".into(),
            });
        }
        if !BUILTIN_STRATEGY_NAMES.contains(&self.resolution.default_strategy.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "resolution.default_strategy".into(),
                detail: format!(
                    "unknown strategy '{}', expected one of: {}",
                    self.resolution.default_strategy,
                    BUILTIN_STRATEGY_NAMES.join(", ")
                ),
            });
        }
        if self.sync.stale_after_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.stale_after_secs".into(),
                detail: "staleness window must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
