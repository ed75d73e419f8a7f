//! Append-only record of detected conflicts and how they were settled.
//!
//! Entries are never deleted (the schema rejects `DELETE`). The only
//! mutation is recording a resolution, and that happens at most once per
//! entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::db::{queries, Database};
use crate::diff::DiffResult;
use crate::errors::DatabaseError;
use crate::models::{ConflictLogEntry, ConflictLogFilter, NewConflictLogEntry};
use crate::resolution::ContentConflict;

/// `conflict_type` used when a diff contains conflicts of different kinds.
pub const MIXED_CONFLICT_TYPE: &str = "multiple";

/// `conflict_type` used when a human was asked to decide without any
/// field-level conflict (for example after a strategy failure).
pub const MANUAL_REVIEW_TYPE: &str = "manual_review";

/// Build a log entry describing the conflicts found in `diff`.
///
/// The details carry the diff summary and the full [`ContentConflict`], so
/// a manual resolution can be applied later from the log alone.
pub fn entry_for_diff(
    type_key: &str,
    local_hash: &str,
    remote_hash: &str,
    ancestor_hash: Option<&str>,
    diff: &DiffResult,
    conflict: &ContentConflict,
) -> NewConflictLogEntry {
    let kinds: BTreeSet<String> = diff
        .conflicts
        .iter()
        .map(|c| c.conflict_type.to_string())
        .collect();
    let conflict_type = match kinds.len() {
        0 => MANUAL_REVIEW_TYPE.to_string(),
        1 => kinds.into_iter().next().unwrap_or_default(),
        _ => MIXED_CONFLICT_TYPE.to_string(),
    };

    NewConflictLogEntry {
        type_key: type_key.to_string(),
        local_hash: Some(local_hash.to_string()),
        remote_hash: Some(remote_hash.to_string()),
        ancestor_hash: ancestor_hash.map(str::to_string),
        conflict_type,
        conflict_details: json!({
            "summary": diff.summary(),
            "conflict": conflict,
        }),
    }
}

/// Recover the [`ContentConflict`] stored by [`entry_for_diff`].
pub fn stored_conflict(entry: &ConflictLogEntry) -> Result<ContentConflict, DatabaseError> {
    let raw = entry
        .conflict_details
        .get("conflict")
        .cloned()
        .unwrap_or(Value::Null);
    Ok(serde_json::from_value(raw)?)
}

/// Handle to the conflict log table.
#[derive(Clone)]
pub struct ConflictLog {
    db: Arc<Database>,
}

impl ConflictLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an entry; returns its id.
    pub fn record_conflict(&self, entry: &NewConflictLogEntry) -> Result<i64, DatabaseError> {
        let id = queries::insert_conflict_log(&self.db.conn(), entry)?;
        info!(id, type_key = %entry.type_key, conflict_type = %entry.conflict_type, "conflict logged");
        Ok(id)
    }

    /// Attach a resolution to an unresolved entry.
    pub fn record_resolution(
        &self,
        id: i64,
        resolution: &Value,
        resolved_by: &str,
    ) -> Result<(), DatabaseError> {
        queries::update_conflict_resolution(&self.db.conn(), id, resolution, resolved_by)
    }

    pub fn get_entry(&self, id: i64) -> Result<ConflictLogEntry, DatabaseError> {
        self.db.get_conflict_log_entry(id)
    }

    /// Newest entries first.
    pub fn list(&self, filter: &ConflictLogFilter) -> Result<Vec<ConflictLogEntry>, DatabaseError> {
        self.db.list_conflict_log(filter)
    }

    pub fn count_unresolved(&self, type_key: Option<&str>) -> Result<i64, DatabaseError> {
        self.db.count_unresolved_conflicts(type_key)
    }
}
