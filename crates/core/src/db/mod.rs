//! SQLite persistence for sync state and the conflict log.
//!
//! [`Database`] serializes access to one connection. Schema changes live in
//! [`schema`]; typed reads and writes live in [`queries`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Pragmas applied to every file-backed connection.
const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Shared handle to the sync-state database. `Send + Sync`, so it is
/// normally held in an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path` without migrating it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening sync-state database");

        let conn = Connection::open(path)?;
        conn.execute_batch(FILE_PRAGMAS)?;
        debug!("journal mode set to WAL");

        Ok(Self::wrap(conn))
    }

    /// Open a database file and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let db = Self::new(path)?;
        db.initialize()?;
        Ok(db)
    }

    /// Unmigrated in-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Apply pending migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::run_migrations(&self.conn())?;
        debug!(version = schema::target_version(), "sync-state schema ready");
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    /// Lock the connection. A poisoned lock is taken over, not propagated.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("sync-state database lock was poisoned, continuing");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction: committed on `Ok`, rolled back on `Err`.
    ///
    /// `E` only has to absorb [`DatabaseError`], so callers can fail the
    /// transaction with their own validation errors.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(result)
    }
}
