//! SQLite persistence handle shared by the dataset, metadata and index map stores.
//!
//! Uses WAL mode so that independently scheduled driver processes can share
//! one database file, and `Arc<Mutex<Connection>>` for thread safety within
//! a process.

use crate::config::DatabaseConfig;
use crate::{PbenchError, Result};
use rusqlite::{ffi, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Cloneable handle to the server database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database at a specific path.
    ///
    /// Creates the database and parent directories if they don't exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| PbenchError::Io {
                    message: format!("Failed to create database directory: {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        debug!("Opened server database at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA foreign_keys=ON;",
            DatabaseConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS datasets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                resource_id TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                access TEXT NOT NULL,
                uploaded TEXT NOT NULL,
                created TEXT NOT NULL,
                state TEXT NOT NULL,
                transition TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_datasets_name ON datasets(name);
            CREATE INDEX IF NOT EXISTS idx_datasets_state ON datasets(state);

            CREATE TABLE IF NOT EXISTS dataset_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_ref INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT,
                user_id TEXT NOT NULL DEFAULT '',
                UNIQUE (dataset_ref, key, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_metadata_key ON dataset_metadata(key);

            CREATE TABLE IF NOT EXISTS indexmaps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset_ref INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
                root TEXT NOT NULL,
                idx TEXT NOT NULL,
                documents TEXT NOT NULL,
                UNIQUE (dataset_ref, root, idx)
            );

            CREATE INDEX IF NOT EXISTS idx_indexmaps_root ON indexmaps(root);
            CREATE INDEX IF NOT EXISTS idx_indexmaps_idx ON indexmaps(idx);",
        )?;
        Ok(())
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PbenchError::Database {
            message: "Failed to acquire database connection lock".to_string(),
            source: None,
        })
    }
}

/// Which constraint, if any, a failed statement violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstraintFailure {
    Duplicate,
    NotNull,
    Other,
}

/// Decode a SQLite error into the constraint it violated.
///
/// Prefers the extended result code and falls back on the message text,
/// which is what older SQLite builds report.
pub(crate) fn constraint_failure(err: &rusqlite::Error) -> ConstraintFailure {
    let rusqlite::Error::SqliteFailure(failure, message) = err else {
        return ConstraintFailure::Other;
    };
    if failure.code != ErrorCode::ConstraintViolation {
        return ConstraintFailure::Other;
    }
    match failure.extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            return ConstraintFailure::Duplicate
        }
        ffi::SQLITE_CONSTRAINT_NOTNULL => return ConstraintFailure::NotNull,
        _ => {}
    }
    let message = message.as_deref().unwrap_or_default();
    if message.contains("UNIQUE constraint failed") {
        ConstraintFailure::Duplicate
    } else if message.contains("NOT NULL constraint failed") {
        ConstraintFailure::NotNull
    } else {
        ConstraintFailure::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(&temp.path().join("nested/server.db")).unwrap();
        let conn = db.lock_conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('datasets', 'dataset_metadata', 'indexmaps')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server.db");
        drop(Database::open(&path).unwrap());
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn test_constraint_decoding() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock_conn().unwrap();
        let insert = "INSERT INTO datasets
            (name, resource_id, owner_id, access, uploaded, created, state, transition)
            VALUES (?1, ?2, 'u', 'private', 't', 't', 'UPLOADING', 't')";
        conn.execute(insert, params!["a", "md5"]).unwrap();

        let dup = conn.execute(insert, params!["b", "md5"]).unwrap_err();
        assert_eq!(constraint_failure(&dup), ConstraintFailure::Duplicate);

        let null = conn
            .execute(insert, params![Option::<String>::None, "other"])
            .unwrap_err();
        assert_eq!(constraint_failure(&null), ConstraintFailure::NotNull);

        let syntax = conn.execute("SELECT FROM", []).unwrap_err();
        assert_eq!(constraint_failure(&syntax), ConstraintFailure::Other);
    }

    #[test]
    fn test_foreign_key_cascade() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock_conn().unwrap();
        conn.execute(
            "INSERT INTO datasets
             (name, resource_id, owner_id, access, uploaded, created, state, transition)
             VALUES ('a', 'md5', 'u', 'private', 't', 't', 'UPLOADING', 't')",
            [],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO dataset_metadata (dataset_ref, key, value) VALUES (?1, 'global', '{}')",
            params![id],
        )
        .unwrap();
        conn.execute("DELETE FROM datasets WHERE id = ?1", params![id])
            .unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM dataset_metadata", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
