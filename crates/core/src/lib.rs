//! ContentSync core library.
//!
//! This crate provides the building blocks for reconciling locally authored
//! content against a remote target system: configuration, SQLite
//! persistence, delta detection, three-way field diffing, conflict
//! resolution strategies, the conflict log, and the reconciliation engine.

pub mod config;
pub mod conflict_log;
pub mod db;
pub mod delta;
pub mod diff;
pub mod errors;
pub mod fingerprint;
pub mod models;
pub mod resolution;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use conflict_log::ConflictLog;
pub use db::Database;
pub use delta::{DeltaCalculator, SyncAction};
pub use diff::{Snapshot, ThreeWayDiffEngine};
pub use fingerprint::{ContentHasher, Sha256Hasher};
pub use resolution::{ResolutionResult, ResolutionStrategy, ResolutionStrategyManager};
pub use store::SyncStateStore;
pub use sync_engine::{ReconcileOutcome, ReconcileReport, ReconcileRequest, SyncEngine};
