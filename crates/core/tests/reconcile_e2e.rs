//! End-to-end tests for reconciliation against a file-backed database.
//!
//! These tests exercise the real `SyncEngine` built from an `AppConfig`,
//! including reopening the database to check that state and the conflict
//! log survive a restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use contentsync_core::config::AppConfig;
use contentsync_core::db::Database;
use contentsync_core::models::{ConflictLogFilter, ConflictStatus, SyncStatus};
use contentsync_core::resolution::ManualChoice;
use contentsync_core::sync_engine::{ReconcileOutcome, ReconcileRequest, SyncEngine};
use contentsync_core::{SyncAction, Snapshot};

// ===========================================================================
// Helpers
// ===========================================================================

fn config_in(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.store.data_dir = dir.path().join("data");
    config
}

fn snap(value: Value) -> Snapshot {
    Snapshot::from_json(value).unwrap()
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_full_cycle_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let ancestor = json!({"title": "Hello", "price": 10, "tags": ["a"]});
    let conflict_id = {
        let engine = SyncEngine::from_config(&config).unwrap();

        let first = engine
            .reconcile(ReconcileRequest::new(
                "products",
                snap(ancestor.clone()),
                snap(ancestor.clone()),
            ))
            .await
            .unwrap();
        assert_eq!(first.outcome, ReconcileOutcome::Synced);

        // The configured default is manual_merge, but auto_merge still wins
        // whenever it can. A shared field forces the human path.
        let report = engine
            .reconcile(
                ReconcileRequest::new(
                    "products",
                    snap(json!({"title": "Hello!", "price": 12, "tags": ["a"]})),
                    snap(json!({"title": "Hello", "price": 15, "tags": ["a", "b"]})),
                )
                .with_ancestor(snap(ancestor.clone()))
                .with_strategy("manual_merge"),
            )
            .await
            .unwrap();
        assert_eq!(report.delta.action, SyncAction::Conflict);
        assert_eq!(report.outcome, ReconcileOutcome::ManualRequired);
        assert_eq!(report.diff.as_ref().unwrap().conflict_count, 1);
        report.conflict_log_id.unwrap()
    };

    // Reopen from disk.
    let engine = SyncEngine::from_config(&config).unwrap();
    let state = engine.store().require_sync_state("products").unwrap();
    assert_eq!(state.sync_status, SyncStatus::Modified);
    assert_eq!(state.conflict_status, ConflictStatus::Detected);
    assert_eq!(engine.store().get_conflicted_types().unwrap().len(), 1);

    let mut choices = BTreeMap::new();
    choices.insert("price".to_string(), ManualChoice::Custom(json!(14)));
    let manual = engine
        .apply_manual_resolution(conflict_id, &choices, "editor@example.com")
        .await
        .unwrap();
    assert_eq!(manual.resolution.merged["price"], json!(14));
    assert_eq!(manual.resolution.merged["title"], json!("Hello!"));
    assert_eq!(manual.resolution.merged["tags"], json!(["a", "b"]));

    let hash = manual.resolved_hash.clone();
    let state = engine.complete_sync("products", &hash, &hash).await.unwrap();
    assert_eq!(state.sync_status, SyncStatus::InSync);
    assert_eq!(state.last_synced_hash.as_deref(), Some(hash.as_str()));

    // Once both sides hold the merged content there is nothing to do.
    let merged = Value::Object(manual.resolution.merged.clone().into_iter().collect());
    let report = engine
        .reconcile(ReconcileRequest::new("products", snap(merged.clone()), snap(merged)))
        .await
        .unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Unchanged);

    let entry = engine.conflict_log().get_entry(conflict_id).unwrap();
    assert_eq!(entry.resolved_by.as_deref(), Some("editor@example.com"));
    assert_eq!(engine.conflict_log().count_unresolved(None).unwrap(), 0);
}

#[tokio::test]
async fn test_same_key_passes_are_serialized() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SyncEngine::from_config(&config_in(&dir)).unwrap());

    let request = ReconcileRequest::new(
        "pages",
        snap(json!({"slug": "about"})),
        snap(json!({"slug": "about-us"})),
    );

    let a = tokio::spawn({
        let engine = Arc::clone(&engine);
        let request = request.clone();
        async move { engine.reconcile(request).await }
    });
    let b = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.reconcile(request).await }
    });

    let mut outcomes = vec![
        a.await.unwrap().unwrap().outcome,
        b.await.unwrap().unwrap().outcome,
    ];
    outcomes.sort_by_key(|o| o.to_string());
    assert_eq!(
        outcomes,
        vec![ReconcileOutcome::ManualRequired, ReconcileOutcome::Unchanged]
    );

    let log = engine
        .conflict_log()
        .list(&ConflictLogFilter::default())
        .unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].conflict_type, "both_added");
}

#[tokio::test]
async fn test_conflict_log_is_append_only_on_disk() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let engine = SyncEngine::from_config(&config).unwrap();
    engine
        .reconcile(
            ReconcileRequest::new("pages", snap(json!({"a": 1})), snap(json!({"a": 2})))
                .with_strategy("manual_merge"),
        )
        .await
        .unwrap();
    drop(engine);

    let db = Database::open(config.store.database_path()).unwrap();
    let result = db.conn().execute("DELETE FROM conflict_log", []);
    assert!(result.is_err());
    assert_eq!(db.count_unresolved_conflicts(Some("pages")).unwrap(), 1);
}
