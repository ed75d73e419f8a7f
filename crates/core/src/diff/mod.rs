//! Field-level change detection between content snapshots.
//!
//! The diff subsystem is responsible for:
//! 1. **Values** -- structural equality over `serde_json::Value` fields.
//! 2. **Changes** -- two-way classification of every field (added, modified,
//!    deleted, unchanged).
//! 3. **Three-way comparison** -- conflicts, mergeable changes and divergence
//!    of local and remote relative to their common ancestor.

pub mod changes;
pub mod engine;
pub mod snapshot;
pub mod value;

pub use changes::{
    calculate_changes, ArrayDiff, ChangeSummary, ChangeType, Changes, FieldModification,
};
pub use engine::{
    ChangeSource, Conflict, ConflictType, DiffResult, DiffSummary, FieldChange,
    FieldConflictKind, FieldDiff, MergeAction, MergeableChange, ResolutionSuggestion,
    ThreeWayDiffEngine,
};
pub use snapshot::{FieldMap, Snapshot};
pub use value::{deep_equal, fields_equal, ValueKind};
