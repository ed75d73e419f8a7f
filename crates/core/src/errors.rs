//! Error types for the ContentSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! A conflict that needs a human is *not* an error: it is reported through
//! [`ResolutionResult::ManualRequired`](crate::resolution::ResolutionResult).

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Sync state errors
// ---------------------------------------------------------------------------

/// Errors from sync-state bookkeeping and the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A request is missing a required field or violates a state invariant.
    #[error("validation failed for '{field}': {detail}")]
    Validation { field: String, detail: String },

    /// No sync state exists for the requested content type.
    #[error("no sync state for content type '{0}'")]
    NotFound(String),

    /// A state-machine transition was invalid.
    #[error("invalid sync state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Resolution could not be applied (unknown strategy, bad manual choice).
    #[error("sync resolution error: {0}")]
    ResolutionError(#[from] ResolutionError),

    /// Storage error, reported upward without retry.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl SyncError {
    pub(crate) fn validation(field: &str, detail: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution errors
// ---------------------------------------------------------------------------

/// Errors from the resolution-strategy subsystem.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The requested strategy is not registered.
    #[error("resolution strategy not found: {0}")]
    StrategyNotFound(String),

    /// A manual choice set is incomplete or refers to an unknown field.
    #[error("invalid manual choice for field '{field}': {detail}")]
    InvalidChoice { field: String, detail: String },

    /// A strategy failed while producing a resolution.
    #[error("merge failed: {0}")]
    MergeFailed(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A conflict-log entry already carries a resolution.
    #[error("conflict log entry {0} is already resolved")]
    AlreadyResolved(i64),

    /// A stored JSON column could not be encoded or decoded.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored column holds a value outside its domain.
    #[error("corrupt {column} value: {value}")]
    CorruptValue { column: String, value: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
