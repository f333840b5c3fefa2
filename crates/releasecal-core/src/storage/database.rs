//! SQLite connection handling for the sync engine.
//!
//! One connection per process, shared across workers behind a mutex. The
//! mutex is held for a single statement at a time -- per-release
//! serialization is the state machine's job, not the database's.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::StoreError;

use super::{data_dir, migrations};

/// SQLite database holding releases, sync state and the audit log.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `~/.config/releasecal/releasecal.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, StoreError> {
        let path = data_dir()
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?
            .join("releasecal.db");
        Self::open_at(&path)
    }

    /// Open the database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_conn(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::OpenFailed {
            path: ":memory:".into(),
            source,
        })?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: Connection) -> Result<Self, StoreError> {
        migrations::migrate(&conn)
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the connection while holding the lock.
    ///
    /// Callers keep their critical section to a single statement or one
    /// short transaction; nothing awaits while the lock is held.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::QueryFailed("connection mutex poisoned".to_string()))?;
        f(&conn).map_err(StoreError::from)
    }
}
