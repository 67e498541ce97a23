use log::{debug, error, info};
use rusqlite::{Connection, OptionalExtension};
use std::{io, path::Path};

use crate::error::LoadError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub struct Database;

impl Database {
    /// Open the control database (progress records, locks, permission windows
    /// and the audit log), creating the schema on first use.
    pub fn open_control(db_path: &Path) -> Result<Connection, LoadError> {
        let conn = Self::open_store(db_path)?;
        Self::ensure_schema(&conn)?;
        Ok(conn)
    }

    #[cfg(test)]
    pub fn open_control_in_memory() -> Result<Connection, LoadError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::ensure_schema(&conn)?;
        Ok(conn)
    }

    /// Open a plain data store (cache, staging or live). No schema is imposed:
    /// the tables are owned by whoever populates them.
    pub fn open_store(db_path: &Path) -> Result<Connection, LoadError> {
        // Ensure the folder exists and is a directory
        if let Some(folder) = db_path.parent() {
            if !folder.as_os_str().is_empty() && !folder.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!(
                        "Database folder '{}' does not exist or is not a directory",
                        folder.display()
                    ),
                )
                .into());
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        debug!("Database opened at: {}", db_path.display());
        Ok(conn)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), LoadError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            info!("Creating control schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()), // Schema is up to date
            Some(other) => Err(LoadError::Error(format!(
                "Schema version mismatch: found {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(LoadError::Error("Schema version missing".to_string())),
        }
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` succeeds. When `f` fails the transaction is rolled
    /// back and the original error is returned; if the rollback itself fails
    /// the rollback error wraps the original one.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, LoadError>
    where
        F: FnOnce(&Connection) -> Result<T, LoadError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                Self::commit(conn)?;
                Ok(value)
            }
            Err(err) => Err(Self::rollback_after(conn, err)),
        }
    }

    /// Commit the open transaction. A failed commit is rolled back and
    /// surfaced as a transaction error.
    pub fn commit(conn: &Connection) -> Result<(), LoadError> {
        if let Err(commit_err) = conn.execute_batch("COMMIT") {
            let err = LoadError::Transaction(Box::new(commit_err.into()));
            return Err(Self::rollback_after(conn, err));
        }
        Ok(())
    }

    /// Roll back the open transaction because of `original`.
    ///
    /// Returns `original` when the rollback succeeds, or
    /// `LoadError::RollbackFailed` carrying both errors when it does not.
    pub fn rollback_after(conn: &Connection, original: LoadError) -> LoadError {
        // A failed COMMIT may already have ended the transaction
        if conn.is_autocommit() {
            return original;
        }

        match conn.execute_batch("ROLLBACK") {
            Ok(()) => original,
            Err(rollback) => {
                error!(
                    "Rollback failed: {} (original error: {})",
                    rollback, original
                );
                LoadError::RollbackFailed {
                    original: Box::new(original),
                    rollback,
                }
            }
        }
    }

    /// Return the current UTC time as a unix timestamp
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_control_schema_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.db");

        let conn = Database::open_control(&path).unwrap();
        drop(conn);

        // Re-opening must accept the stored version
        let conn = Database::open_control(&path).unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.db");

        let conn = Database::open_control(&path).unwrap();
        conn.execute(
            "UPDATE meta SET value = '99' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        drop(conn);

        let result = Database::open_control(&path);
        assert!(matches!(result, Err(LoadError::Error(msg)) if msg.contains("mismatch")));
    }

    #[test]
    fn test_open_store_rejects_missing_folder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("live.db");
        assert!(matches!(
            Database::open_store(&path),
            Err(LoadError::IoError(_))
        ));
    }

    #[test]
    fn test_immediate_transaction_commits_on_success() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();

        Database::immediate_transaction(&conn, |c| {
            c.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();

        let result: Result<(), LoadError> = Database::immediate_transaction(&conn, |c| {
            c.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Err(LoadError::Error("boom".into()))
        });

        assert!(matches!(result, Err(LoadError::Error(msg)) if msg == "boom"));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(conn.is_autocommit());
    }
}
