//! Database schema definitions and migration runner.
//!
//! Migrations are plain SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "sync state and conflict log",
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            type_key         TEXT    NOT NULL UNIQUE,
            local_hash       TEXT,
            remote_hash      TEXT,
            last_synced_hash TEXT,
            last_sync_at     TEXT,
            sync_status      TEXT    NOT NULL DEFAULT 'new'
                CHECK (sync_status IN ('new', 'pending', 'syncing', 'modified', 'in_sync', 'failed')),
            conflict_status  TEXT    NOT NULL DEFAULT 'none'
                CHECK (conflict_status IN ('none', 'detected', 'resolved')),
            sync_progress    TEXT,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_state_status ON sync_state (sync_status);
        CREATE INDEX IF NOT EXISTS idx_sync_state_last_sync_at ON sync_state (last_sync_at);

        CREATE TABLE IF NOT EXISTS conflict_log (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            type_key         TEXT NOT NULL,
            local_hash       TEXT,
            remote_hash      TEXT,
            ancestor_hash    TEXT,
            conflict_type    TEXT NOT NULL,
            conflict_details TEXT NOT NULL,
            resolution       TEXT,
            resolved_by      TEXT,
            resolved_at      TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conflict_log_type_key ON conflict_log (type_key);
        CREATE INDEX IF NOT EXISTS idx_conflict_log_resolved_at ON conflict_log (resolved_at);
        "#,
    ),
    (
        2,
        "conflict log is append-only",
        r#"
        CREATE TRIGGER IF NOT EXISTS conflict_log_no_delete
        BEFORE DELETE ON conflict_log
        BEGIN
            SELECT RAISE(ABORT, 'conflict_log is append-only');
        END;
        "#,
    ),
    (
        3,
        "hash both sides were last confirmed to hold",
        r#"
        ALTER TABLE sync_state ADD COLUMN confirmed_hash TEXT;
        UPDATE sync_state SET confirmed_hash = last_synced_hash WHERE sync_status = 'in_sync';
        "#,
    ),
];

/// Latest schema version known to this build.
pub fn target_version() -> u32 {
    MIGRATIONS.last().map(|m| m.0).unwrap_or(0)
}

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = target_version(),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
