//! Sync-state bookkeeping per content type.
//!
//! [`SyncStateStore`] owns every read-modify-write of the `sync_state` table.
//! Each operation runs in one SQLite transaction, validates the status
//! transition against the state machine below and checks the row
//! invariants before writing.
//!
//! ```text
//! new -> pending -> syncing -> { in_sync | failed | modified }
//! in_sync -> modified              (drift detected)
//! failed | modified -> syncing     (retry)
//! modified -> in_sync              (only once the conflict is resolved)
//! pending | syncing | modified -> failed
//! ```
//!
//! The `pub(crate)` functions take a `&Connection` so the sync engine can
//! combine them with conflict-log writes inside a single transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::db::{queries, Database};
use crate::errors::SyncError;
use crate::models::{
    ConflictStatus, NewConflictLogEntry, SyncState, SyncStateUpdate, SyncStatus,
    PARTIAL_SYNC_ROLLBACK,
};

// ---------------------------------------------------------------------------
// Connection-level operations
// ---------------------------------------------------------------------------

pub(crate) fn load(conn: &Connection, type_key: &str) -> Result<SyncState, SyncError> {
    queries::get_sync_state(conn, type_key)?.ok_or_else(|| SyncError::NotFound(type_key.to_string()))
}

/// Load the state for `type_key`, creating a `new` one on first observation.
pub(crate) fn ensure(conn: &Connection, type_key: &str) -> Result<SyncState, SyncError> {
    if type_key.trim().is_empty() {
        return Err(SyncError::validation("type_key", "must not be empty"));
    }
    if let Some(state) = queries::get_sync_state(conn, type_key)? {
        return Ok(state);
    }
    let mut state = SyncState::new(type_key);
    state.id = queries::insert_sync_state(conn, &state)?;
    info!(type_key, "tracking new content type");
    Ok(state)
}

/// Validate and persist `next`, which was derived from `prev`.
pub(crate) fn save(
    conn: &Connection,
    prev: &SyncState,
    mut next: SyncState,
) -> Result<SyncState, SyncError> {
    if !prev
        .sync_status
        .can_transition_to(next.sync_status, prev.conflict_status)
    {
        return Err(SyncError::InvalidStateTransition {
            from: prev.sync_status.to_string(),
            to: next.sync_status.to_string(),
        });
    }
    write(conn, &mut next)?;
    Ok(next)
}

/// Persist `state` after checking invariants, skipping transition checks.
fn write(conn: &Connection, state: &mut SyncState) -> Result<(), SyncError> {
    state.check_invariants()?;
    state.updated_at = Utc::now();
    queries::update_sync_state(conn, state)?;
    Ok(())
}

pub(crate) fn transition(
    conn: &Connection,
    type_key: &str,
    to: SyncStatus,
) -> Result<SyncState, SyncError> {
    let prev = load(conn, type_key)?;
    let mut next = prev.clone();
    next.sync_status = to;
    debug!(type_key, from = %prev.sync_status, to = %to, "sync status transition");
    save(conn, &prev, next)
}

pub(crate) fn mark_as_synced(
    conn: &Connection,
    type_key: &str,
    local_hash: &str,
    remote_hash: &str,
) -> Result<SyncState, SyncError> {
    if local_hash != remote_hash {
        return Err(SyncError::validation(
            "remote_hash",
            format!("local hash '{local_hash}' and remote hash '{remote_hash}' must match to mark as synced"),
        ));
    }
    let prev = load(conn, type_key)?;
    let mut next = prev.clone();
    next.local_hash = Some(local_hash.to_string());
    next.remote_hash = Some(remote_hash.to_string());
    next.last_synced_hash = Some(local_hash.to_string());
    next.confirmed_hash = Some(local_hash.to_string());
    next.last_sync_at = Some(Utc::now());
    next.sync_status = SyncStatus::InSync;
    next.conflict_status = ConflictStatus::None;
    next.sync_progress = None;
    let state = save(conn, &prev, next)?;
    info!(type_key, hash = local_hash, "content type in sync");
    Ok(state)
}

pub(crate) fn mark_as_conflicted(
    conn: &Connection,
    type_key: &str,
    local_hash: &str,
    remote_hash: &str,
) -> Result<SyncState, SyncError> {
    let prev = load(conn, type_key)?;
    let mut next = prev.clone();
    next.local_hash = Some(local_hash.to_string());
    next.remote_hash = Some(remote_hash.to_string());
    next.sync_status = SyncStatus::Modified;
    next.conflict_status = ConflictStatus::Detected;
    let state = save(conn, &prev, next)?;
    info!(type_key, "conflict detected");
    Ok(state)
}

pub(crate) fn resolve_conflict(
    conn: &Connection,
    type_key: &str,
    resolved_hash: &str,
) -> Result<SyncState, SyncError> {
    let prev = load(conn, type_key)?;
    match prev.conflict_status {
        ConflictStatus::Detected => {}
        ConflictStatus::Resolved if prev.last_synced_hash.as_deref() == Some(resolved_hash) => {
            return Ok(prev);
        }
        other => {
            return Err(SyncError::validation(
                "conflict_status",
                format!("no detected conflict to resolve (status {other})"),
            ));
        }
    }
    let mut next = prev.clone();
    next.conflict_status = ConflictStatus::Resolved;
    next.last_synced_hash = Some(resolved_hash.to_string());
    let state = save(conn, &prev, next)?;
    info!(type_key, resolved_hash, "conflict resolved");
    Ok(state)
}

/// Revert to the last known-good state, the hash both sides were last
/// confirmed to hold.
///
/// A resolution that was never written out is not known-good, so
/// `last_synced_hash` falls back to the confirmed hash as well. The failed
/// attempt's hashes are appended to the conflict log first. A type that was
/// never synced ends up `failed` with no hashes. This is the one write that
/// does not follow the transition table.
pub(crate) fn rollback_partial_sync(
    conn: &Connection,
    type_key: &str,
) -> Result<SyncState, SyncError> {
    let prev = load(conn, type_key)?;

    let log_id = queries::insert_conflict_log(
        conn,
        &NewConflictLogEntry {
            type_key: type_key.to_string(),
            local_hash: prev.local_hash.clone(),
            remote_hash: prev.remote_hash.clone(),
            ancestor_hash: prev.confirmed_hash.clone(),
            conflict_type: PARTIAL_SYNC_ROLLBACK.to_string(),
            conflict_details: json!({
                "previous_status": prev.sync_status,
                "previous_conflict_status": prev.conflict_status,
                "previous_last_synced_hash": prev.last_synced_hash,
                "sync_progress": prev.sync_progress,
            }),
        },
    )?;
    queries::update_conflict_resolution(conn, log_id, &json!("rolled_back"), "system")?;

    let mut next = prev.clone();
    next.conflict_status = ConflictStatus::None;
    next.sync_progress = None;
    next.local_hash = prev.confirmed_hash.clone();
    next.remote_hash = prev.confirmed_hash.clone();
    next.last_synced_hash = prev.confirmed_hash.clone();
    next.sync_status = match prev.confirmed_hash {
        Some(_) => SyncStatus::InSync,
        None => SyncStatus::Failed,
    };
    write(conn, &mut next)?;
    warn!(type_key, log_id, status = %next.sync_status, "partial sync rolled back");
    Ok(next)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Transactional access to per-content-type sync state.
#[derive(Clone)]
pub struct SyncStateStore {
    db: Arc<Database>,
}

impl SyncStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get_sync_state(&self, type_key: &str) -> Result<Option<SyncState>, SyncError> {
        Ok(self.db.get_sync_state(type_key)?)
    }

    /// Like [`get_sync_state`](Self::get_sync_state), but a missing state is
    /// a `NotFound` error.
    pub fn require_sync_state(&self, type_key: &str) -> Result<SyncState, SyncError> {
        self.get_sync_state(type_key)?
            .ok_or_else(|| SyncError::NotFound(type_key.to_string()))
    }

    pub fn ensure_sync_state(&self, type_key: &str) -> Result<SyncState, SyncError> {
        self.db.transaction(|conn| ensure(conn, type_key))
    }

    pub fn list_all(&self) -> Result<Vec<SyncState>, SyncError> {
        Ok(self.db.list_sync_states()?)
    }

    /// Apply a partial update. A status change must follow the state machine.
    pub fn update_sync_state(
        &self,
        type_key: &str,
        update: &SyncStateUpdate,
    ) -> Result<SyncState, SyncError> {
        self.db.transaction(|conn| {
            let prev = load(conn, type_key)?;
            let mut next = prev.clone();
            update.apply_to(&mut next);
            save(conn, &prev, next)
        })
    }

    pub fn transition(&self, type_key: &str, to: SyncStatus) -> Result<SyncState, SyncError> {
        self.db.transaction(|conn| transition(conn, type_key, to))
    }

    /// Record agreement: both hashes equal, status `in_sync`, no conflict.
    pub fn mark_as_synced(
        &self,
        type_key: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<SyncState, SyncError> {
        self.db
            .transaction(|conn| mark_as_synced(conn, type_key, local_hash, remote_hash))
    }

    /// Record divergence: status `modified`, conflict `detected`.
    pub fn mark_as_conflicted(
        &self,
        type_key: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<SyncState, SyncError> {
        self.db
            .transaction(|conn| mark_as_conflicted(conn, type_key, local_hash, remote_hash))
    }

    /// Clear a detected conflict and remember the hash it was resolved to.
    /// Status stays `modified` until the resolved content is synchronized.
    pub fn resolve_conflict(
        &self,
        type_key: &str,
        resolved_hash: &str,
    ) -> Result<SyncState, SyncError> {
        self.db
            .transaction(|conn| resolve_conflict(conn, type_key, resolved_hash))
    }

    pub fn rollback_partial_sync(&self, type_key: &str) -> Result<SyncState, SyncError> {
        self.db.transaction(|conn| rollback_partial_sync(conn, type_key))
    }

    /// Store an orchestrator-owned progress payload verbatim.
    pub fn set_sync_progress(&self, type_key: &str, progress: Value) -> Result<SyncState, SyncError> {
        self.update_sync_state(
            type_key,
            &SyncStateUpdate {
                sync_progress: Some(progress),
                ..Default::default()
            },
        )
    }

    /// Content types stuck in `syncing` for longer than `stale_after`.
    pub fn detect_interrupted_sync(
        &self,
        stale_after: chrono::Duration,
    ) -> Result<Vec<SyncState>, SyncError> {
        let cutoff = Utc::now() - stale_after;
        Ok(queries::list_stale_syncing(&self.db.conn(), cutoff)?)
    }

    pub fn get_content_types_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncState>, SyncError> {
        Ok(queries::list_sync_states_since(&self.db.conn(), since)?)
    }

    pub fn get_conflicted_types(&self) -> Result<Vec<SyncState>, SyncError> {
        Ok(queries::list_sync_states_by_conflict(
            &self.db.conn(),
            ConflictStatus::Detected,
        )?)
    }

    /// Content types in `pending`, `new` or `modified`.
    pub fn get_pending_sync_types(&self) -> Result<Vec<SyncState>, SyncError> {
        let pending: Vec<SyncStatus> = SyncStatus::ALL
            .into_iter()
            .filter(SyncStatus::is_pending_sync)
            .collect();
        Ok(queries::list_sync_states_by_status(&self.db.conn(), &pending)?)
    }
}
