use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::Connection;

use crate::database::Database;
use crate::date_strategy::LoadWindow;
use crate::error::LoadError;
use crate::migration::TableMigration;
use crate::utils::Utils;

/// Lifecycle state of one load run in the audit log.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running = 0,
    Completed = 1,
    Failed = 2,
}

impl RunStatus {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => RunStatus::Running,
            1 => RunStatus::Completed,
            2 => RunStatus::Failed,
            _ => {
                warn!(
                    "Invalid RunStatus value in database: {}, defaulting to Failed",
                    value
                );
                RunStatus::Failed
            }
        }
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        }
    }
}

/// Append-only sink for load run history.
pub trait AuditLog {
    fn record_run_started(&self, load_progress_id: i64, window: &LoadWindow)
        -> Result<i64, LoadError>;

    /// Close the run as complete with its per-table counts
    fn record_run_completed(&self, run_id: i64, tables: &[TableMigration])
        -> Result<(), LoadError>;

    fn record_run_failed(&self, run_id: i64, reason: &str) -> Result<(), LoadError>;
}

/// A closed or open run, as read back for display
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRun {
    pub run_id: i64,
    pub load_progress_id: i64,
    pub window: LoadWindow,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub inserts: Option<i64>,
    pub updates: Option<i64>,
    pub message: Option<String>,
}

/// Audit log kept in the control database (`load_runs`, `load_run_tables`).
pub struct SqliteAuditLog<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteAuditLog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Runs of `load_progress_id`, most recent first
    pub fn runs_for(&self, load_progress_id: i64, limit: i64) -> Result<Vec<LoadRun>, LoadError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, load_progress_id, window_start, window_end, status,
                    start_time, end_time, inserts, updates, message
             FROM load_runs
             WHERE load_progress_id = ?
             ORDER BY run_id DESC
             LIMIT ?",
        )?;

        let rows = stmt
            .query_map([load_progress_id, limit], |row| {
                Ok(LoadRun {
                    run_id: row.get(0)?,
                    load_progress_id: row.get(1)?,
                    window: LoadWindow {
                        start: Utils::timestamp(row.get(2)?, 2)?,
                        end: Utils::timestamp(row.get(3)?, 3)?,
                    },
                    status: RunStatus::from_i64(row.get(4)?),
                    start_time: Utils::timestamp(row.get(5)?, 5)?,
                    end_time: Utils::opt_timestamp(row.get(6)?, 6)?,
                    inserts: row.get(7)?,
                    updates: row.get(8)?,
                    message: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-table counts recorded for a completed run
    pub fn tables_for(&self, run_id: i64) -> Result<Vec<TableMigration>, LoadError> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name, inserts, updates FROM load_run_tables
             WHERE run_id = ?
             ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok(TableMigration {
                    table_name: row.get(0)?,
                    inserts: row.get::<_, i64>(1)? as u64,
                    updates: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl AuditLog for SqliteAuditLog<'_> {
    fn record_run_started(
        &self,
        load_progress_id: i64,
        window: &LoadWindow,
    ) -> Result<i64, LoadError> {
        let run_id: i64 = self.conn.query_row(
            "INSERT INTO load_runs (load_progress_id, window_start, window_end, status, start_time)
             VALUES (?, ?, ?, ?, ?)
             RETURNING run_id",
            rusqlite::params![
                load_progress_id,
                window.start.timestamp(),
                window.end.timestamp(),
                RunStatus::Running.as_i64(),
                Database::now(),
            ],
            |row| row.get(0),
        )?;
        debug!("Started run {} for window {}", run_id, window);
        Ok(run_id)
    }

    fn record_run_completed(
        &self,
        run_id: i64,
        tables: &[TableMigration],
    ) -> Result<(), LoadError> {
        let inserts: u64 = tables.iter().map(|t| t.inserts).sum();
        let updates: u64 = tables.iter().map(|t| t.updates).sum();

        Database::immediate_transaction(self.conn, |c| {
            for table in tables {
                c.execute(
                    "INSERT INTO load_run_tables (run_id, table_name, inserts, updates)
                     VALUES (?, ?, ?, ?)",
                    rusqlite::params![
                        run_id,
                        table.table_name,
                        table.inserts as i64,
                        table.updates as i64
                    ],
                )?;
            }
            c.execute(
                "UPDATE load_runs SET status = ?, end_time = ?, inserts = ?, updates = ?
                 WHERE run_id = ?",
                rusqlite::params![
                    RunStatus::Completed.as_i64(),
                    Database::now(),
                    inserts as i64,
                    updates as i64,
                    run_id
                ],
            )?;
            Ok(())
        })
    }

    fn record_run_failed(&self, run_id: i64, reason: &str) -> Result<(), LoadError> {
        self.conn.execute(
            "UPDATE load_runs SET status = ?, end_time = ?, message = ? WHERE run_id = ?",
            rusqlite::params![RunStatus::Failed.as_i64(), Database::now(), reason, run_id],
        )?;
        debug!("Run {} failed: {}", run_id, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::test_support::{control_with_load, date};
    use pretty_assertions::assert_eq;

    fn window() -> LoadWindow {
        LoadWindow {
            start: date("2001-01-01"),
            end: date("2001-01-02"),
        }
    }

    #[test]
    fn test_completed_run_is_closed_with_counts() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-01-05"), 1);
        let audit = SqliteAuditLog::new(&conn);

        let run_id = audit.record_run_started(id, &window()).unwrap();
        let open = audit.runs_for(id, 10).unwrap();
        assert_eq!(open[0].status, RunStatus::Running);
        assert_eq!(open[0].end_time, None);

        let tables = vec![
            TableMigration {
                table_name: "events".into(),
                inserts: 3,
                updates: 1,
            },
            TableMigration {
                table_name: "totals".into(),
                inserts: 0,
                updates: 2,
            },
        ];
        audit.record_run_completed(run_id, &tables).unwrap();

        let runs = audit.runs_for(id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].window, window());
        assert!(runs[0].end_time.is_some());
        assert_eq!(runs[0].inserts, Some(3));
        assert_eq!(runs[0].updates, Some(3));
        assert_eq!(audit.tables_for(run_id).unwrap(), tables);
    }

    #[test]
    fn test_failed_run_keeps_reason() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-01-05"), 1);
        let audit = SqliteAuditLog::new(&conn);

        let run_id = audit.record_run_started(id, &window()).unwrap();
        audit.record_run_failed(run_id, "boom").unwrap();

        let runs = audit.runs_for(id, 10).unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].message.as_deref(), Some("boom"));
        assert!(audit.tables_for(run_id).unwrap().is_empty());
    }

    #[test]
    fn test_run_status_from_i64() {
        assert_eq!(RunStatus::from_i64(1), RunStatus::Completed);
        assert_eq!(RunStatus::from_i64(42), RunStatus::Failed);
    }
}
