//! Reconciliation engine.
//!
//! The [`SyncEngine`] runs one reconciliation pass per content type:
//!
//! 1. Fingerprint both sides and compute the delta against the stored state.
//! 2. Move the content type into `syncing`.
//! 3. Three-way diff local and remote against the ancestor.
//! 4. Resolve with the requested strategy, or the best applicable one.
//! 5. Persist the conflict log entry and the new sync state in one
//!    transaction.
//!
//! Passes for the same content type are serialized through a per-key lock;
//! different content types proceed concurrently. If step 5 fails the
//! content type is left `failed`.
//!
//! Writing merged content back to either system belongs to the caller, who
//! reports the outcome through [`SyncEngine::complete_sync`] or
//! [`SyncEngine::fail_sync`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::conflict_log::{self, ConflictLog};
use crate::db::{queries, Database};
use crate::delta::{Delta, DeltaCalculator, DeltaRequest, DeltaResponse, SyncAction};
use crate::diff::{fields_equal, DiffResult, DiffSummary, FieldMap, Snapshot, ThreeWayDiffEngine};
use crate::errors::{CoreError, DatabaseError, SyncError};
use crate::fingerprint::{ContentHasher, Sha256Hasher};
use crate::models::{ConflictStatus, SyncState, SyncStatus};
use crate::resolution::{
    apply_manual_choices, ContentConflict, ManualChoice, Resolution, ResolutionResult,
    ResolutionStrategyManager,
};
use crate::store::{self, SyncStateStore};

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Input for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub type_key: String,
    pub local: Snapshot,
    pub remote: Snapshot,
    /// Last version both sides agreed on. Without it every differing field
    /// is treated as added on both sides.
    #[serde(default)]
    pub ancestor: Option<Snapshot>,
    /// Strategy to use instead of automatic selection.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub structural: bool,
}

impl ReconcileRequest {
    pub fn new(type_key: impl Into<String>, local: Snapshot, remote: Snapshot) -> Self {
        Self {
            type_key: type_key.into(),
            local,
            remote,
            ancestor: None,
            strategy: None,
            structural: false,
        }
    }

    pub fn with_ancestor(mut self, ancestor: Snapshot) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Hashes match the stored state; nothing was written.
    Unchanged,
    /// Both sides already hold the merged content; the type is `in_sync`.
    Synced,
    /// A merged version exists and must be written to both sides before
    /// calling [`SyncEngine::complete_sync`].
    Resolved,
    /// A human has to decide; see the conflict log entry.
    ManualRequired,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::Synced => write!(f, "synced"),
            Self::Resolved => write!(f, "resolved"),
            Self::ManualRequired => write!(f, "manual_required"),
        }
    }
}

/// Everything a reconciliation pass decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub attempt_id: Uuid,
    pub type_key: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub delta: Delta,
    pub outcome: ReconcileOutcome,
    pub diff: Option<DiffSummary>,
    pub result: Option<ResolutionResult>,
    pub conflict_log_id: Option<i64>,
    /// Fingerprint of the merged content, when there is one.
    pub resolved_hash: Option<String>,
    pub state: Option<SyncState>,
}

impl ReconcileReport {
    /// Merged field data to write to both sides, if the pass produced it.
    pub fn merged(&self) -> Option<&Resolution> {
        match self.outcome {
            ReconcileOutcome::Resolved | ReconcileOutcome::Synced => {
                self.result.as_ref().and_then(ResolutionResult::resolution)
            }
            _ => None,
        }
    }
}

/// Result of applying a human's choices to a logged conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualResolutionReport {
    pub conflict_log_id: i64,
    pub resolution: Resolution,
    pub resolved_hash: String,
    pub state: SyncState,
    /// False when the content type had already moved past this conflict.
    pub state_updated: bool,
}

type LockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds one content type's lock. On drop the table entry is removed once
/// nobody else holds or waits for it.
struct KeyGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    type_key: String,
    locks: &'a LockTable,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.type_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.type_key);
        }
    }
}

struct Persisted {
    outcome: ReconcileOutcome,
    conflict_log_id: Option<i64>,
    resolved_hash: Option<String>,
    state: SyncState,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<Database>,
    store: SyncStateStore,
    log: ConflictLog,
    resolver: ResolutionStrategyManager,
    hasher: Arc<dyn ContentHasher>,
    stale_after: chrono::Duration,
    locks: LockTable,
}

impl SyncEngine {
    pub fn new(db: Arc<Database>, resolver: ResolutionStrategyManager) -> Self {
        info!(default_strategy = resolver.default_strategy(), "initializing sync engine");
        Self {
            store: SyncStateStore::new(Arc::clone(&db)),
            log: ConflictLog::new(Arc::clone(&db)),
            db,
            resolver,
            hasher: Arc::new(Sha256Hasher),
            stale_after: crate::config::SyncConfig::default().stale_after(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open the configured database and build an engine around it.
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let path = config.store.database_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(DatabaseError::IoError)?;
        }
        let db = Database::open(&path)?;
        let resolver = ResolutionStrategyManager::from_config(&config.resolution)?;
        Ok(Self::new(Arc::new(db), resolver).with_stale_after(config.sync.stale_after()))
    }

    /// Replace the built-in SHA-256 fingerprinting.
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &SyncStateStore {
        &self.store
    }

    pub fn conflict_log(&self) -> &ConflictLog {
        &self.log
    }

    pub fn resolver(&self) -> &ResolutionStrategyManager {
        &self.resolver
    }

    pub fn hasher(&self) -> &dyn ContentHasher {
        self.hasher.as_ref()
    }

    /// Fingerprint of merged field data. A merge equal to one side reuses
    /// that side's hash, so caller-supplied hashes stay comparable with the
    /// stored ones.
    fn merged_hash(&self, merged: &FieldMap, conflict: &ContentConflict) -> String {
        [&conflict.local, &conflict.remote]
            .into_iter()
            .find(|side| fields_equal(merged, &side.data))
            .map(|side| self.hasher.fingerprint_snapshot(side))
            .unwrap_or_else(|| self.hasher.fingerprint(merged))
    }

    async fn lock_key(&self, type_key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(type_key.to_string()).or_default())
        };
        KeyGuard {
            guard: Some(lock.lock_owned().await),
            type_key: type_key.to_string(),
            locks: &self.locks,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Which action the given hashes call for. Read-only.
    pub fn query_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, SyncError> {
        request.validate()?;
        let state = self.store.get_sync_state(&request.type_key)?;
        let delta = DeltaCalculator::calculate(
            &request.current_local_hash,
            &request.current_remote_hash,
            state.as_ref(),
        );
        debug!(type_key = %request.type_key, action = %delta.action, "delta computed");
        Ok(DeltaResponse::new(delta, state))
    }

    /// Three-way diff of a request's snapshots without touching any state.
    pub fn preview(&self, request: &ReconcileRequest) -> (DiffResult, ResolutionResult) {
        let diff = ThreeWayDiffEngine::compare_versions(
            Some(&request.local),
            Some(&request.remote),
            request.ancestor.as_ref(),
        );
        let conflict = ContentConflict::from_diff(&diff).with_structural(request.structural);
        let result = self
            .resolver
            .resolve_conflict(&conflict, request.strategy.as_deref());
        (diff, result)
    }

    // -----------------------------------------------------------------------
    // Sync lifecycle
    // -----------------------------------------------------------------------

    /// Move a content type into `syncing`, creating its state if needed.
    pub async fn begin_sync(&self, type_key: &str) -> Result<SyncState, SyncError> {
        let _guard = self.lock_key(type_key).await;
        self.db.transaction(|conn| begin_sync_in(conn, type_key))
    }

    /// Run one reconciliation pass. See the module documentation.
    pub async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileReport, SyncError> {
        if request.type_key.trim().is_empty() {
            return Err(SyncError::validation("type_key", "must not be empty"));
        }
        let type_key = request.type_key.as_str();
        let _guard = self.lock_key(type_key).await;
        let attempt_id = Uuid::new_v4();

        let local_hash = self.hasher.fingerprint_snapshot(&request.local);
        let remote_hash = self.hasher.fingerprint_snapshot(&request.remote);
        let stored = self.store.get_sync_state(type_key)?;
        let delta = DeltaCalculator::calculate(&local_hash, &remote_hash, stored.as_ref());
        info!(%attempt_id, type_key, action = %delta.action, "reconciling");

        let mut report = ReconcileReport {
            attempt_id,
            type_key: type_key.to_string(),
            local_hash: local_hash.clone(),
            remote_hash: remote_hash.clone(),
            delta,
            outcome: ReconcileOutcome::Unchanged,
            diff: None,
            result: None,
            conflict_log_id: None,
            resolved_hash: None,
            state: stored.clone(),
        };
        if report.delta.action == SyncAction::NoChange {
            return Ok(report);
        }

        self.db.transaction(|conn| begin_sync_in(conn, type_key))?;

        let (diff, result) = self.preview(&request);
        let conflict = ContentConflict::from_diff(&diff).with_structural(request.structural);
        let ancestor_hash = request
            .ancestor
            .as_ref()
            .map(|a| self.hasher.fingerprint_snapshot(a))
            .or_else(|| stored.and_then(|s| s.last_synced_hash));

        let persisted = self.db.transaction(|conn| {
            self.persist_pass(
                conn,
                type_key,
                &local_hash,
                &remote_hash,
                ancestor_hash.as_deref(),
                &diff,
                &conflict,
                &result,
            )
        });

        let persisted = match persisted {
            Ok(p) => p,
            Err(e) => {
                warn!(%attempt_id, type_key, error = %e, "reconcile could not be persisted");
                if let Err(mark) = self.mark_failed(type_key, &e.to_string()) {
                    warn!(type_key, error = %mark, "could not mark sync as failed");
                }
                return Err(e);
            }
        };

        info!(
            %attempt_id,
            type_key,
            outcome = %persisted.outcome,
            conflicts = diff.conflicts.len(),
            "reconcile finished"
        );
        report.outcome = persisted.outcome;
        report.diff = Some(diff.summary());
        report.result = Some(result);
        report.conflict_log_id = persisted.conflict_log_id;
        report.resolved_hash = persisted.resolved_hash;
        report.state = Some(persisted.state);
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_pass(
        &self,
        conn: &Connection,
        type_key: &str,
        local_hash: &str,
        remote_hash: &str,
        ancestor_hash: Option<&str>,
        diff: &DiffResult,
        conflict: &ContentConflict,
        result: &ResolutionResult,
    ) -> Result<Persisted, SyncError> {
        let mut entry =
            conflict_log::entry_for_diff(type_key, local_hash, remote_hash, ancestor_hash, diff, conflict);

        // Fully resolved by a strategy.
        if let ResolutionResult::Resolved {
            resolution,
            strategy_used,
            ..
        } = result
        {
            if resolution.conflicts.is_empty() {
                let resolved_hash = self.merged_hash(&resolution.merged, conflict);
                let mut conflict_log_id = None;

                if diff.has_conflicts() {
                    let id = queries::insert_conflict_log(conn, &entry)?;
                    let recorded = serde_json::to_value(result).map_err(DatabaseError::from)?;
                    queries::update_conflict_resolution(
                        conn,
                        id,
                        &recorded,
                        &format!("strategy:{strategy_used}"),
                    )?;
                    store::mark_as_conflicted(conn, type_key, local_hash, remote_hash)?;
                    store::resolve_conflict(conn, type_key, &resolved_hash)?;
                    conflict_log_id = Some(id);
                }

                let (outcome, state) = if resolved_hash == local_hash && resolved_hash == remote_hash {
                    let state = store::mark_as_synced(conn, type_key, &resolved_hash, &resolved_hash)?;
                    (ReconcileOutcome::Synced, state)
                } else {
                    let state = record_observed_hashes(conn, type_key, local_hash, remote_hash)?;
                    (ReconcileOutcome::Resolved, state)
                };

                return Ok(Persisted {
                    outcome,
                    conflict_log_id,
                    resolved_hash: Some(resolved_hash),
                    state,
                });
            }
        }

        // Anything else goes to a human.
        if let (ResolutionResult::Failed { error, .. }, Value::Object(details)) =
            (result, &mut entry.conflict_details)
        {
            details.insert("error".into(), json!(error));
        }
        let id = queries::insert_conflict_log(conn, &entry)?;
        let state = store::mark_as_conflicted(conn, type_key, local_hash, remote_hash)?;
        Ok(Persisted {
            outcome: ReconcileOutcome::ManualRequired,
            conflict_log_id: Some(id),
            resolved_hash: None,
            state,
        })
    }

    /// Record that both sides now hold the same content.
    pub async fn complete_sync(
        &self,
        type_key: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<SyncState, SyncError> {
        let _guard = self.lock_key(type_key).await;
        self.store.mark_as_synced(type_key, local_hash, remote_hash)
    }

    /// Record that the caller could not finish writing a sync.
    pub async fn fail_sync(&self, type_key: &str, reason: &str) -> Result<SyncState, SyncError> {
        let _guard = self.lock_key(type_key).await;
        self.mark_failed(type_key, reason)
    }

    fn mark_failed(&self, type_key: &str, reason: &str) -> Result<SyncState, SyncError> {
        let state = self.db.transaction(|conn| {
            let prev = store::load(conn, type_key)?;
            let mut next = prev.clone();
            next.sync_status = SyncStatus::Failed;
            next.conflict_status = ConflictStatus::None;
            next.sync_progress = Some(json!({
                "error": reason,
                "failed_at": Utc::now(),
            }));
            store::save(conn, &prev, next)
        })?;
        warn!(type_key, reason, "sync failed");
        Ok(state)
    }

    /// Revert a content type to its last known-good state.
    pub async fn rollback(&self, type_key: &str) -> Result<SyncState, SyncError> {
        let _guard = self.lock_key(type_key).await;
        self.store.rollback_partial_sync(type_key)
    }

    /// Apply a human's per-field choices to a logged conflict.
    ///
    /// The log entry is resolved regardless; the sync state is only updated
    /// while it still describes the same conflict.
    pub async fn apply_manual_resolution(
        &self,
        conflict_log_id: i64,
        choices: &BTreeMap<String, ManualChoice>,
        resolved_by: &str,
    ) -> Result<ManualResolutionReport, SyncError> {
        if resolved_by.trim().is_empty() {
            return Err(SyncError::validation("resolved_by", "must not be empty"));
        }
        let entry = self.log.get_entry(conflict_log_id)?;
        let _guard = self.lock_key(&entry.type_key).await;
        if entry.is_resolved() {
            return Err(DatabaseError::AlreadyResolved(entry.id).into());
        }

        let conflict = conflict_log::stored_conflict(&entry)?;
        let resolution = apply_manual_choices(&conflict, choices)?;
        let resolved_hash = self.merged_hash(&resolution.merged, &conflict);
        let recorded = json!({
            "outcome": "resolved",
            "resolution": resolution,
            "strategy_used": "manual_merge",
            "auto_resolved": false,
        });

        let (state, state_updated) = self.db.transaction(|conn| {
            queries::update_conflict_resolution(conn, entry.id, &recorded, resolved_by)?;
            let state = store::load(conn, &entry.type_key)?;
            let current = state.conflict_status == ConflictStatus::Detected
                && state.local_hash == entry.local_hash
                && state.remote_hash == entry.remote_hash;
            if current {
                Ok::<_, SyncError>((store::resolve_conflict(conn, &entry.type_key, &resolved_hash)?, true))
            } else {
                debug!(type_key = %entry.type_key, id = entry.id, "conflict superseded, state left as is");
                Ok((state, false))
            }
        })?;

        info!(
            type_key = %entry.type_key,
            id = entry.id,
            resolved_by,
            state_updated,
            "manual resolution applied"
        );
        Ok(ManualResolutionReport {
            conflict_log_id: entry.id,
            resolution,
            resolved_hash,
            state,
            state_updated,
        })
    }

    /// Content types stuck in `syncing` beyond the staleness window.
    pub fn detect_interrupted(&self) -> Result<Vec<SyncState>, SyncError> {
        self.store.detect_interrupted_sync(self.stale_after)
    }

    /// Mark every interrupted sync as `failed`. Returns the updated states.
    pub async fn recover_interrupted(&self) -> Result<Vec<SyncState>, SyncError> {
        let mut recovered = Vec::new();
        for candidate in self.detect_interrupted()? {
            let _guard = self.lock_key(&candidate.type_key).await;
            let cutoff = Utc::now() - self.stale_after;
            let current = self.store.require_sync_state(&candidate.type_key)?;
            // Another pass may have finished it in the meantime.
            if current.sync_status != SyncStatus::Syncing || current.updated_at >= cutoff {
                continue;
            }
            recovered.push(self.mark_failed(&candidate.type_key, "sync interrupted")?);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted syncs");
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Walk the state machine from wherever the content type is to `syncing`.
fn begin_sync_in(conn: &Connection, type_key: &str) -> Result<SyncState, SyncError> {
    let state = store::ensure(conn, type_key)?;
    let path: &[SyncStatus] = match state.sync_status {
        SyncStatus::New => &[SyncStatus::Pending, SyncStatus::Syncing],
        SyncStatus::Pending | SyncStatus::Failed | SyncStatus::Modified => &[SyncStatus::Syncing],
        SyncStatus::InSync => &[SyncStatus::Modified, SyncStatus::Syncing],
        SyncStatus::Syncing => {
            return Err(SyncError::InvalidStateTransition {
                from: SyncStatus::Syncing.to_string(),
                to: SyncStatus::Syncing.to_string(),
            });
        }
    };

    let mut state = state;
    for &status in path {
        let mut next = state.clone();
        next.sync_status = status;
        // A fresh attempt starts without a conflict; an unresolved one stays
        // open in the conflict log.
        if status == SyncStatus::Syncing && next.conflict_status != ConflictStatus::None {
            info!(type_key, conflict = %next.conflict_status, "previous conflict superseded");
            next.conflict_status = ConflictStatus::None;
        }
        state = store::save(conn, &state, next)?;
    }
    Ok(state)
}

fn record_observed_hashes(
    conn: &Connection,
    type_key: &str,
    local_hash: &str,
    remote_hash: &str,
) -> Result<SyncState, SyncError> {
    let prev = store::load(conn, type_key)?;
    let mut next = prev.clone();
    next.local_hash = Some(local_hash.to_string());
    next.remote_hash = Some(remote_hash.to_string());
    store::save(conn, &prev, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConflictLogFilter;
    use crate::resolution::Winner;

    fn engine() -> SyncEngine {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        SyncEngine::new(Arc::new(db), ResolutionStrategyManager::with_builtin_strategies())
    }

    fn snap(value: Value) -> Snapshot {
        Snapshot::from_json(value).unwrap()
    }

    #[tokio::test]
    async fn test_identical_sides_sync_immediately() {
        let engine = engine();
        let doc = json!({"title": "A", "body": "x"});
        let report = engine
            .reconcile(ReconcileRequest::new("articles", snap(doc.clone()), snap(doc)))
            .await
            .unwrap();

        assert_eq!(report.delta.action, SyncAction::InitialSync);
        assert_eq!(report.outcome, ReconcileOutcome::Synced);
        let state = report.state.unwrap();
        assert_eq!(state.sync_status, SyncStatus::InSync);
        assert_eq!(state.last_synced_hash.as_deref(), Some(report.local_hash.as_str()));
        assert!(report.conflict_log_id.is_none());
    }

    #[tokio::test]
    async fn test_second_pass_is_unchanged() {
        let engine = engine();
        let doc = json!({"title": "A"});
        let request = ReconcileRequest::new("articles", snap(doc.clone()), snap(doc));
        engine.reconcile(request.clone()).await.unwrap();

        let report = engine.reconcile(request).await.unwrap();
        assert_eq!(report.delta.action, SyncAction::NoChange);
        assert_eq!(report.outcome, ReconcileOutcome::Unchanged);
        assert!(report.result.is_none());
    }

    #[tokio::test]
    async fn test_independent_edits_auto_merge() {
        let engine = engine();
        let ancestor = json!({"title": "A", "tags": ["x"]});
        let base = ReconcileRequest::new("articles", snap(ancestor.clone()), snap(ancestor.clone()));
        engine.reconcile(base).await.unwrap();

        let report = engine
            .reconcile(
                ReconcileRequest::new(
                    "articles",
                    snap(json!({"title": "A2", "tags": ["x"]})),
                    snap(json!({"title": "A", "tags": ["x", "y"]})),
                )
                .with_ancestor(snap(ancestor)),
            )
            .await
            .unwrap();

        assert_eq!(report.delta.action, SyncAction::Conflict);
        assert_eq!(report.outcome, ReconcileOutcome::Resolved);
        let merged = report.merged().unwrap();
        assert_eq!(merged.merged["title"], json!("A2"));
        assert_eq!(merged.merged["tags"], json!(["x", "y"]));
        assert_eq!(report.result.as_ref().unwrap().strategy_used(), Some("auto_merge"));

        let state = report.state.unwrap();
        assert_eq!(state.sync_status, SyncStatus::Syncing);

        let hash = report.resolved_hash.unwrap();
        let state = engine.complete_sync("articles", &hash, &hash).await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::InSync);
    }

    #[tokio::test]
    async fn test_manual_conflict_round_trip() {
        let engine = engine();
        let ancestor = json!({"price": 10});
        engine
            .reconcile(ReconcileRequest::new("products", snap(ancestor.clone()), snap(ancestor.clone())))
            .await
            .unwrap();

        let report = engine
            .reconcile(
                ReconcileRequest::new("products", snap(json!({"price": 12})), snap(json!({"price": 15})))
                    .with_ancestor(snap(ancestor))
                    .with_strategy("manual_merge"),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::ManualRequired);
        let state = report.state.unwrap();
        assert_eq!(state.sync_status, SyncStatus::Modified);
        assert_eq!(state.conflict_status, ConflictStatus::Detected);

        let log_id = report.conflict_log_id.unwrap();
        let entry = engine.conflict_log().get_entry(log_id).unwrap();
        assert_eq!(entry.conflict_type, "both_modified");
        assert!(!entry.is_resolved());

        let mut choices = BTreeMap::new();
        choices.insert("price".to_string(), ManualChoice::Remote);
        let manual = engine
            .apply_manual_resolution(log_id, &choices, "alice")
            .await
            .unwrap();
        assert!(manual.state_updated);
        assert_eq!(manual.resolution.merged["price"], json!(15));
        assert_eq!(manual.state.conflict_status, ConflictStatus::Resolved);
        assert_eq!(engine.conflict_log().count_unresolved(None).unwrap(), 0);

        let again = engine.apply_manual_resolution(log_id, &choices, "bob").await;
        assert!(matches!(
            again,
            Err(SyncError::DatabaseError(DatabaseError::AlreadyResolved(_)))
        ));

        let hash = manual.resolved_hash;
        let state = engine.complete_sync("products", &hash, &hash).await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::InSync);
    }

    #[tokio::test]
    async fn test_strategy_resolution_is_logged() {
        let engine = engine();
        let ancestor = json!({"price": 10});
        engine
            .reconcile(ReconcileRequest::new("products", snap(ancestor.clone()), snap(ancestor.clone())))
            .await
            .unwrap();

        let report = engine
            .reconcile(
                ReconcileRequest::new("products", snap(json!({"price": 12})), snap(json!({"price": 15})))
                    .with_ancestor(snap(ancestor))
                    .with_strategy("remote_wins"),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Resolved);
        assert_eq!(report.merged().unwrap().winner, Winner::Remote);

        let entry = engine
            .conflict_log()
            .get_entry(report.conflict_log_id.unwrap())
            .unwrap();
        assert!(entry.is_resolved());
        assert_eq!(entry.resolved_by.as_deref(), Some("strategy:remote_wins"));
        assert_eq!(report.state.unwrap().conflict_status, ConflictStatus::Resolved);
    }

    #[tokio::test]
    async fn test_unknown_strategy_goes_to_manual() {
        let engine = engine();
        let report = engine
            .reconcile(
                ReconcileRequest::new("pages", snap(json!({"a": 1})), snap(json!({"a": 2})))
                    .with_strategy("newest_wins"),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::ManualRequired);
        let entry = engine
            .conflict_log()
            .get_entry(report.conflict_log_id.unwrap())
            .unwrap();
        assert!(entry.conflict_details["error"]
            .as_str()
            .unwrap()
            .contains("newest_wins"));
    }

    #[tokio::test]
    async fn test_new_pass_supersedes_open_conflict() {
        let engine = engine();
        let ancestor = json!({"a": 0});
        engine
            .reconcile(ReconcileRequest::new("pages", snap(ancestor.clone()), snap(ancestor.clone())))
            .await
            .unwrap();
        let first = engine
            .reconcile(
                ReconcileRequest::new("pages", snap(json!({"a": 1})), snap(json!({"a": 2})))
                    .with_ancestor(snap(ancestor.clone()))
                    .with_strategy("manual_merge"),
            )
            .await
            .unwrap();
        let stale_id = first.conflict_log_id.unwrap();

        // Both sides converge before anyone resolves the logged conflict.
        let agreed = json!({"a": 3});
        let second = engine
            .reconcile(
                ReconcileRequest::new("pages", snap(agreed.clone()), snap(agreed))
                    .with_ancestor(snap(ancestor)),
            )
            .await
            .unwrap();
        assert_eq!(second.outcome, ReconcileOutcome::Synced);
        assert_eq!(second.state.unwrap().conflict_status, ConflictStatus::None);

        let mut choices = BTreeMap::new();
        choices.insert("a".to_string(), ManualChoice::Local);
        let manual = engine
            .apply_manual_resolution(stale_id, &choices, "alice")
            .await
            .unwrap();
        assert!(!manual.state_updated);
        assert_eq!(manual.state.sync_status, SyncStatus::InSync);
    }

    #[tokio::test]
    async fn test_begin_sync_walks_and_rejects_reentry() {
        let engine = engine();
        let state = engine.begin_sync("articles").await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::Syncing);
        assert!(matches!(
            engine.begin_sync("articles").await,
            Err(SyncError::InvalidStateTransition { .. })
        ));

        let state = engine.fail_sync("articles", "remote timed out").await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::Failed);
        assert_eq!(state.sync_progress.unwrap()["error"], json!("remote timed out"));
        let state = engine.begin_sync("articles").await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let engine = engine().with_stale_after(chrono::Duration::seconds(-1));
        engine.begin_sync("articles").await.unwrap();
        engine.begin_sync("pages").await.unwrap();
        engine.fail_sync("pages", "boom").await.unwrap();

        let recovered = engine.recover_interrupted().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].type_key, "articles");
        assert_eq!(recovered[0].sync_status, SyncStatus::Failed);
        assert!(engine.detect_interrupted().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_delta() {
        let engine = engine();
        let request = DeltaRequest {
            type_key: "articles".into(),
            current_local_hash: "a".into(),
            current_remote_hash: "b".into(),
        };
        let response = engine.query_delta(&request).unwrap();
        assert_eq!(response.delta.action, SyncAction::InitialSync);
        assert!(response.current_state.is_none());

        let bad = DeltaRequest {
            type_key: "".into(),
            ..request
        };
        assert!(matches!(engine.query_delta(&bad), Err(SyncError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_rollback_after_conflict() {
        let engine = engine();
        let doc = json!({"a": 0});
        engine
            .reconcile(ReconcileRequest::new("pages", snap(doc.clone()), snap(doc.clone())))
            .await
            .unwrap();
        let good = engine.store().require_sync_state("pages").unwrap().last_synced_hash;

        engine
            .reconcile(
                ReconcileRequest::new("pages", snap(json!({"a": 1})), snap(json!({"a": 2})))
                    .with_ancestor(snap(doc))
                    .with_strategy("manual_merge"),
            )
            .await
            .unwrap();

        let state = engine.rollback("pages").await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::InSync);
        assert_eq!(state.local_hash, good);
        let log = engine
            .conflict_log()
            .list(&ConflictLogFilter::default())
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].conflict_type, crate::models::PARTIAL_SYNC_ROLLBACK);
    }

    #[tokio::test]
    async fn test_rollback_after_strategy_resolution() {
        let engine = engine();
        let ancestor = json!({"price": 10});
        engine
            .reconcile(ReconcileRequest::new("products", snap(ancestor.clone()), snap(ancestor.clone())))
            .await
            .unwrap();
        let good = engine.store().require_sync_state("products").unwrap().last_synced_hash;

        let request = ReconcileRequest::new("products", snap(json!({"price": 12})), snap(json!({"price": 15})))
            .with_ancestor(snap(ancestor))
            .with_strategy("local_wins");
        let report = engine.reconcile(request.clone()).await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Resolved);
        assert_eq!(report.resolved_hash.as_deref(), Some(report.local_hash.as_str()));

        // The merged content was never written, so rolling back returns to
        // the last content both sides held.
        let state = engine.rollback("products").await.unwrap();
        assert_eq!(state.sync_status, SyncStatus::InSync);
        assert_eq!(state.local_hash, good);
        assert_eq!(state.remote_hash, good);
        assert_eq!(state.last_synced_hash, good);

        let delta = engine
            .query_delta(&DeltaRequest {
                type_key: "products".into(),
                current_local_hash: report.local_hash.clone(),
                current_remote_hash: report.remote_hash.clone(),
            })
            .unwrap();
        assert_eq!(delta.delta.action, SyncAction::Conflict);
    }

    #[tokio::test]
    async fn test_caller_supplied_hashes_converge() {
        let engine = engine();
        let same = snap(json!({"title": "A"})).with_hash("h1");
        let first = engine
            .reconcile(ReconcileRequest::new("articles", same.clone(), same.clone()))
            .await
            .unwrap();
        assert_eq!(first.outcome, ReconcileOutcome::Synced);
        assert_eq!(first.resolved_hash.as_deref(), Some("h1"));
        assert_eq!(first.state.unwrap().last_synced_hash.as_deref(), Some("h1"));

        let second = engine
            .reconcile(ReconcileRequest::new("articles", same.clone(), same.clone()))
            .await
            .unwrap();
        assert_eq!(second.delta.action, SyncAction::NoChange);
        assert_eq!(second.outcome, ReconcileOutcome::Unchanged);

        // A local edit merges onto the local side's own hash.
        let edited = snap(json!({"title": "B"})).with_hash("h2");
        let pushed = engine
            .reconcile(
                ReconcileRequest::new("articles", edited.clone(), same.clone())
                    .with_ancestor(same),
            )
            .await
            .unwrap();
        assert_eq!(pushed.delta.action, SyncAction::Push);
        assert_eq!(pushed.outcome, ReconcileOutcome::Resolved);
        assert_eq!(pushed.resolved_hash.as_deref(), Some("h2"));

        engine.complete_sync("articles", "h2", "h2").await.unwrap();
        let third = engine
            .reconcile(ReconcileRequest::new("articles", edited.clone(), edited))
            .await
            .unwrap();
        assert_eq!(third.outcome, ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_idle_key_locks_are_released() {
        let engine = engine();
        let guard = engine.lock_key("pages").await;
        assert_eq!(engine.locks.lock().unwrap().len(), 1);
        drop(guard);
        assert!(engine.locks.lock().unwrap().is_empty());

        let doc = json!({"a": 1});
        engine
            .reconcile(ReconcileRequest::new("pages", snap(doc.clone()), snap(doc)))
            .await
            .unwrap();
        assert!(engine.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let doc = json!({"n": i});
                engine
                    .reconcile(ReconcileRequest::new(format!("type-{i}"), snap(doc.clone()), snap(doc)))
                    .await
            }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.outcome, ReconcileOutcome::Synced);
        }
        assert_eq!(engine.store().list_all().unwrap().len(), 8);
    }
}
