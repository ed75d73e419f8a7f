//! Typed query helpers for the `sync_state` and `conflict_log` tables.
//!
//! Every query is a free function over a `&Connection` so that callers can
//! compose several of them inside one [`Database::transaction`]. The
//! `impl Database` block at the bottom offers locked, single-statement
//! shortcuts for read paths.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    ConflictLogEntry, ConflictLogFilter, ConflictStatus, NewConflictLogEntry, SyncState,
    SyncStatus,
};

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that SQL
/// string comparison orders them chronologically.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::CorruptValue {
            column: column.to_string(),
            value: value.to_string(),
        })
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

fn parse_optional_json(value: Option<String>) -> Result<Option<Value>, DatabaseError> {
    Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
}

fn to_optional_json(value: &Option<Value>) -> Result<Option<String>, DatabaseError> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

// ---------------------------------------------------------------------------
// sync_state
// ---------------------------------------------------------------------------

const SYNC_STATE_COLUMNS: &str = "id, type_key, local_hash, remote_hash, last_synced_hash, \
     last_sync_at, sync_status, conflict_status, sync_progress, created_at, updated_at, confirmed_hash";

/// A `sync_state` row exactly as stored.
struct SyncStateRow {
    id: i64,
    type_key: String,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    last_synced_hash: Option<String>,
    last_sync_at: Option<String>,
    sync_status: String,
    conflict_status: String,
    sync_progress: Option<String>,
    created_at: String,
    updated_at: String,
    confirmed_hash: Option<String>,
}

impl SyncStateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            type_key: row.get(1)?,
            local_hash: row.get(2)?,
            remote_hash: row.get(3)?,
            last_synced_hash: row.get(4)?,
            last_sync_at: row.get(5)?,
            sync_status: row.get(6)?,
            conflict_status: row.get(7)?,
            sync_progress: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            confirmed_hash: row.get(11)?,
        })
    }

    fn into_model(self) -> Result<SyncState, DatabaseError> {
        Ok(SyncState {
            id: self.id,
            type_key: self.type_key,
            local_hash: self.local_hash,
            remote_hash: self.remote_hash,
            last_synced_hash: self.last_synced_hash,
            confirmed_hash: self.confirmed_hash,
            last_sync_at: parse_optional_timestamp("last_sync_at", self.last_sync_at)?,
            sync_status: self.sync_status.parse::<SyncStatus>()?,
            conflict_status: self.conflict_status.parse::<ConflictStatus>()?,
            sync_progress: parse_optional_json(self.sync_progress)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

fn query_sync_states(
    conn: &Connection,
    where_clause: &str,
    bound: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<SyncState>, DatabaseError> {
    let sql = format!(
        "SELECT {SYNC_STATE_COLUMNS} FROM sync_state {where_clause} ORDER BY type_key"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(bound, SyncStateRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(SyncStateRow::into_model).collect()
}

/// Fetch the state for `type_key`, if any.
pub(crate) fn get_sync_state(
    conn: &Connection,
    type_key: &str,
) -> Result<Option<SyncState>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {SYNC_STATE_COLUMNS} FROM sync_state WHERE type_key = ?1"),
            params![type_key],
            SyncStateRow::from_row,
        )
        .optional()?;
    row.map(SyncStateRow::into_model).transpose()
}

/// Insert a new row for `state` and return its id.
pub(crate) fn insert_sync_state(conn: &Connection, state: &SyncState) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO sync_state (type_key, local_hash, remote_hash, last_synced_hash,
         last_sync_at, sync_status, conflict_status, sync_progress, created_at, updated_at,
         confirmed_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            state.type_key,
            state.local_hash,
            state.remote_hash,
            state.last_synced_hash,
            state.last_sync_at.map(format_timestamp),
            state.sync_status.as_str(),
            state.conflict_status.as_str(),
            to_optional_json(&state.sync_progress)?,
            format_timestamp(state.created_at),
            format_timestamp(state.updated_at),
            state.confirmed_hash,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, type_key = %state.type_key, "inserted sync state");
    Ok(id)
}

/// Overwrite every mutable column of the row for `state.type_key`.
pub(crate) fn update_sync_state(conn: &Connection, state: &SyncState) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE sync_state SET local_hash = ?1, remote_hash = ?2, last_synced_hash = ?3,
         last_sync_at = ?4, sync_status = ?5, conflict_status = ?6, sync_progress = ?7,
         updated_at = ?8, confirmed_hash = ?9
         WHERE type_key = ?10",
        params![
            state.local_hash,
            state.remote_hash,
            state.last_synced_hash,
            state.last_sync_at.map(format_timestamp),
            state.sync_status.as_str(),
            state.conflict_status.as_str(),
            to_optional_json(&state.sync_progress)?,
            format_timestamp(state.updated_at),
            state.confirmed_hash,
            state.type_key,
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "sync_state".into(),
            id: state.type_key.clone(),
        });
    }
    debug!(
        type_key = %state.type_key,
        status = %state.sync_status,
        conflict = %state.conflict_status,
        "updated sync state"
    );
    Ok(())
}

pub(crate) fn list_sync_states(conn: &Connection) -> Result<Vec<SyncState>, DatabaseError> {
    query_sync_states(conn, "", &[])
}

pub(crate) fn list_sync_states_by_status(
    conn: &Connection,
    statuses: &[SyncStatus],
) -> Result<Vec<SyncState>, DatabaseError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{i}")).collect();
    let names: Vec<&str> = statuses.iter().map(SyncStatus::as_str).collect();
    let bound: Vec<&dyn rusqlite::types::ToSql> =
        names.iter().map(|n| n as &dyn rusqlite::types::ToSql).collect();
    query_sync_states(
        conn,
        &format!("WHERE sync_status IN ({})", placeholders.join(", ")),
        &bound,
    )
}

pub(crate) fn list_sync_states_by_conflict(
    conn: &Connection,
    status: ConflictStatus,
) -> Result<Vec<SyncState>, DatabaseError> {
    query_sync_states(conn, "WHERE conflict_status = ?1", &[&status.as_str()])
}

/// States whose last successful sync happened at or after `since`.
pub(crate) fn list_sync_states_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<Vec<SyncState>, DatabaseError> {
    query_sync_states(
        conn,
        "WHERE last_sync_at IS NOT NULL AND last_sync_at >= ?1",
        &[&format_timestamp(since)],
    )
}

/// States stuck in `syncing` whose last write is older than `cutoff`.
pub(crate) fn list_stale_syncing(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<SyncState>, DatabaseError> {
    query_sync_states(
        conn,
        "WHERE sync_status = 'syncing' AND updated_at < ?1",
        &[&format_timestamp(cutoff)],
    )
}

// ---------------------------------------------------------------------------
// conflict_log
// ---------------------------------------------------------------------------

const CONFLICT_LOG_COLUMNS: &str = "id, type_key, local_hash, remote_hash, ancestor_hash, \
     conflict_type, conflict_details, resolution, resolved_by, resolved_at, created_at";

struct ConflictLogRow {
    id: i64,
    type_key: String,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    ancestor_hash: Option<String>,
    conflict_type: String,
    conflict_details: String,
    resolution: Option<String>,
    resolved_by: Option<String>,
    resolved_at: Option<String>,
    created_at: String,
}

impl ConflictLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            type_key: row.get(1)?,
            local_hash: row.get(2)?,
            remote_hash: row.get(3)?,
            ancestor_hash: row.get(4)?,
            conflict_type: row.get(5)?,
            conflict_details: row.get(6)?,
            resolution: row.get(7)?,
            resolved_by: row.get(8)?,
            resolved_at: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_model(self) -> Result<ConflictLogEntry, DatabaseError> {
        Ok(ConflictLogEntry {
            id: self.id,
            type_key: self.type_key,
            local_hash: self.local_hash,
            remote_hash: self.remote_hash,
            ancestor_hash: self.ancestor_hash,
            conflict_type: self.conflict_type,
            conflict_details: serde_json::from_str(&self.conflict_details)?,
            resolution: parse_optional_json(self.resolution)?,
            resolved_by: self.resolved_by,
            resolved_at: parse_optional_timestamp("resolved_at", self.resolved_at)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

/// Append a conflict-log entry and return its id.
pub(crate) fn insert_conflict_log(
    conn: &Connection,
    entry: &NewConflictLogEntry,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO conflict_log (type_key, local_hash, remote_hash, ancestor_hash,
         conflict_type, conflict_details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.type_key,
            entry.local_hash,
            entry.remote_hash,
            entry.ancestor_hash,
            entry.conflict_type,
            serde_json::to_string(&entry.conflict_details)?,
            format_timestamp(Utc::now()),
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, type_key = %entry.type_key, conflict_type = %entry.conflict_type, "appended conflict log entry");
    Ok(id)
}

pub(crate) fn get_conflict_log_entry(
    conn: &Connection,
    id: i64,
) -> Result<ConflictLogEntry, DatabaseError> {
    conn.query_row(
        &format!("SELECT {CONFLICT_LOG_COLUMNS} FROM conflict_log WHERE id = ?1"),
        params![id],
        ConflictLogRow::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
            entity: "conflict_log".into(),
            id: id.to_string(),
        },
        other => other.into(),
    })?
    .into_model()
}

/// Record the resolution of an unresolved entry. Entries are resolved once.
pub(crate) fn update_conflict_resolution(
    conn: &Connection,
    id: i64,
    resolution: &Value,
    resolved_by: &str,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE conflict_log SET resolution = ?1, resolved_by = ?2, resolved_at = ?3
         WHERE id = ?4 AND resolved_at IS NULL",
        params![
            serde_json::to_string(resolution)?,
            resolved_by,
            format_timestamp(Utc::now()),
            id
        ],
    )?;
    if changed == 0 {
        // Distinguish a missing entry from one that was already resolved.
        let entry = get_conflict_log_entry(conn, id)?;
        return Err(DatabaseError::AlreadyResolved(entry.id));
    }
    debug!(id, resolved_by, "recorded conflict resolution");
    Ok(())
}

pub(crate) fn list_conflict_log(
    conn: &Connection,
    filter: &ConflictLogFilter,
) -> Result<Vec<ConflictLogEntry>, DatabaseError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut bound: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(type_key) = &filter.type_key {
        bound.push(Box::new(type_key.clone()));
        clauses.push(format!("type_key = ?{}", bound.len()));
    }
    if filter.unresolved_only {
        clauses.push("resolved_at IS NULL".to_string());
    }

    let mut sql = format!("SELECT {CONFLICT_LOG_COLUMNS} FROM conflict_log");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        bound.push(Box::new(limit));
        sql.push_str(&format!(" LIMIT ?{}", bound.len()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = bound.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), ConflictLogRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ConflictLogRow::into_model).collect()
}

pub(crate) fn count_unresolved_conflicts(
    conn: &Connection,
    type_key: Option<&str>,
) -> Result<i64, DatabaseError> {
    let count: i64 = match type_key {
        Some(key) => conn.query_row(
            "SELECT COUNT(*) FROM conflict_log WHERE resolved_at IS NULL AND type_key = ?1",
            params![key],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM conflict_log WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?,
    };
    Ok(count)
}

// ---------------------------------------------------------------------------
// Locked shortcuts
// ---------------------------------------------------------------------------

impl Database {
    pub fn get_sync_state(&self, type_key: &str) -> Result<Option<SyncState>, DatabaseError> {
        get_sync_state(&self.conn(), type_key)
    }

    pub fn list_sync_states(&self) -> Result<Vec<SyncState>, DatabaseError> {
        list_sync_states(&self.conn())
    }

    pub fn get_conflict_log_entry(&self, id: i64) -> Result<ConflictLogEntry, DatabaseError> {
        get_conflict_log_entry(&self.conn(), id)
    }

    pub fn list_conflict_log(
        &self,
        filter: &ConflictLogFilter,
    ) -> Result<Vec<ConflictLogEntry>, DatabaseError> {
        list_conflict_log(&self.conn(), filter)
    }

    pub fn count_unresolved_conflicts(&self, type_key: Option<&str>) -> Result<i64, DatabaseError> {
        count_unresolved_conflicts(&self.conn(), type_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn new_entry(type_key: &str) -> NewConflictLogEntry {
        NewConflictLogEntry {
            type_key: type_key.into(),
            local_hash: Some("l1".into()),
            remote_hash: Some("r1".into()),
            ancestor_hash: None,
            conflict_type: "both_modified".into(),
            conflict_details: json!({"conflicting_fields": ["price"]}),
        }
    }

    #[test]
    fn test_sync_state_crud() {
        let db = setup_db();
        let conn = db.conn();

        let mut state = SyncState::new("articles");
        state.sync_progress = Some(json!({"done": 3, "of": 10}));
        let id = insert_sync_state(&conn, &state).unwrap();
        assert!(id > 0);

        let loaded = get_sync_state(&conn, "articles").unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::New);
        assert_eq!(loaded.sync_progress, Some(json!({"done": 3, "of": 10})));

        let mut updated = loaded.clone();
        updated.local_hash = Some("abc".into());
        updated.sync_status = SyncStatus::Pending;
        update_sync_state(&conn, &updated).unwrap();
        let reloaded = get_sync_state(&conn, "articles").unwrap().unwrap();
        assert_eq!(reloaded.local_hash.as_deref(), Some("abc"));
        assert_eq!(reloaded.sync_status, SyncStatus::Pending);

        assert!(get_sync_state(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_type_key_is_unique() {
        let db = setup_db();
        let conn = db.conn();
        insert_sync_state(&conn, &SyncState::new("pages")).unwrap();
        assert!(insert_sync_state(&conn, &SyncState::new("pages")).is_err());
    }

    #[test]
    fn test_status_filters() {
        let db = setup_db();
        let conn = db.conn();
        for (key, status) in [
            ("a", SyncStatus::New),
            ("b", SyncStatus::Syncing),
            ("c", SyncStatus::Modified),
        ] {
            let mut state = SyncState::new(key);
            state.sync_status = status;
            insert_sync_state(&conn, &state).unwrap();
        }

        let pending =
            list_sync_states_by_status(&conn, &[SyncStatus::New, SyncStatus::Modified]).unwrap();
        let keys: Vec<&str> = pending.iter().map(|s| s.type_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);

        let stale = list_stale_syncing(&conn, Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(stale.len(), 1);
        let fresh = list_stale_syncing(&conn, Utc::now() - chrono::Duration::hours(1)).unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_conflict_log_resolution_is_recorded_once() {
        let db = setup_db();
        let conn = db.conn();
        let id = insert_conflict_log(&conn, &new_entry("articles")).unwrap();

        let entry = get_conflict_log_entry(&conn, id).unwrap();
        assert!(!entry.is_resolved());
        assert_eq!(count_unresolved_conflicts(&conn, None).unwrap(), 1);

        update_conflict_resolution(&conn, id, &json!({"winner": "local"}), "alice").unwrap();
        let entry = get_conflict_log_entry(&conn, id).unwrap();
        assert!(entry.is_resolved());
        assert_eq!(entry.resolved_by.as_deref(), Some("alice"));
        assert_eq!(count_unresolved_conflicts(&conn, Some("articles")).unwrap(), 0);

        let again = update_conflict_resolution(&conn, id, &json!({}), "bob");
        assert!(matches!(again, Err(DatabaseError::AlreadyResolved(_))));

        let missing = update_conflict_resolution(&conn, 999, &json!({}), "bob");
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn test_list_conflict_log_filter() {
        let db = setup_db();
        {
            let conn = db.conn();
            insert_conflict_log(&conn, &new_entry("articles")).unwrap();
            insert_conflict_log(&conn, &new_entry("pages")).unwrap();
            let id = insert_conflict_log(&conn, &new_entry("articles")).unwrap();
            update_conflict_resolution(&conn, id, &json!({}), "system").unwrap();
        }

        let all = db.list_conflict_log(&ConflictLogFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].id > all[1].id);

        let filter = ConflictLogFilter {
            type_key: Some("articles".into()),
            unresolved_only: true,
            limit: Some(10),
        };
        let open = db.list_conflict_log(&filter).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].type_key, "articles");
    }

    #[test]
    fn test_timestamps_sort_as_strings() {
        let early = format_timestamp(Utc::now() - chrono::Duration::seconds(5));
        let late = format_timestamp(Utc::now());
        assert!(early < late);
        assert!(late.ends_with('Z'));
    }
}
