use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{types::Value, Connection};
use thiserror::Error;

use crate::database::Database;
use crate::error::LoadError;
use crate::fetch_request::CacheFetchRequest;
use crate::migration::{quote, table_exists, ColumnSet, TableSpec};
use crate::utils::Utils;

/// A window that could not be retrieved. Absorbed by the load job: the
/// window is treated as not yet cached and progress is left alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("window starting {} failed: {message}", Utils::format_date(.start))]
pub struct FetchFailure {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub message: String,
}

impl FetchFailure {
    pub fn new(request: &CacheFetchRequest, message: impl Into<String>) -> Self {
        Self {
            start: request.start,
            end: request.end(),
            message: message.into(),
        }
    }

    /// Append to the failure log of `load_progress_id`
    pub fn record(&self, conn: &Connection, load_progress_id: i64) -> Result<(), LoadError> {
        conn.execute(
            "INSERT INTO fetch_failures (load_progress_id, window_start, window_end, message, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![
                load_progress_id,
                self.start.timestamp(),
                self.end.timestamp(),
                self.message,
                Database::now(),
            ],
        )?;
        warn!(
            "Recorded fetch failure for load progress {}: {}",
            load_progress_id, self
        );
        Ok(())
    }

    /// Failures recorded for `load_progress_id`, oldest first
    pub fn list_for(conn: &Connection, load_progress_id: i64) -> Result<Vec<Self>, LoadError> {
        let mut stmt = conn.prepare(
            "SELECT window_start, window_end, message
             FROM fetch_failures
             WHERE load_progress_id = ?
             ORDER BY failure_id",
        )?;
        let rows = stmt
            .query_map([load_progress_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(start, end, message)| {
                Ok(FetchFailure {
                    start: Utils::from_timestamp(start)?,
                    end: Utils::from_timestamp(end)?,
                    message,
                })
            })
            .collect()
    }
}

/// Populates the staging store for one request.
pub trait Fetcher {
    /// Stage the rows of `columns` for `request`, returning how many rows
    /// were staged.
    fn fetch(
        &mut self,
        request: &CacheFetchRequest,
        columns: &ColumnSet,
        staging: &Connection,
    ) -> Result<u64, FetchFailure>;
}

/// Copies windows out of a local cache database into staging.
pub struct CacheDatabaseFetcher<'a> {
    cache: &'a Connection,
}

impl<'a> CacheDatabaseFetcher<'a> {
    pub fn new(cache: &'a Connection) -> Self {
        Self { cache }
    }

    fn stage_table(
        &self,
        request: &CacheFetchRequest,
        table: &TableSpec,
        staging: &Connection,
    ) -> Result<u64, LoadError> {
        if !table_exists(self.cache, &table.name)? {
            debug!("Cache has no table '{}'", table.name);
            return Ok(0);
        }

        staging.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&table.name),
            table.column_list()
        ))?;

        let mut sql = format!("SELECT {} FROM {}", table.column_list(), quote(&table.name));
        let mut params: Vec<i64> = Vec::new();
        if let Some(date_column) = &table.date_column {
            sql.push_str(&format!(
                " WHERE {col} >= ? AND {col} < ?",
                col = quote(date_column)
            ));
            params.push(request.start.timestamp());
            params.push(request.end().timestamp());
        }

        let column_count = table.columns.len();
        let mut select = self.cache.prepare(&sql)?;
        let rows = select
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                (0..column_count)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut insert = staging.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&table.name),
            table.column_list(),
            table.placeholders()
        ))?;
        for row in &rows {
            insert.execute(rusqlite::params_from_iter(row.iter()))?;
        }

        Ok(rows.len() as u64)
    }
}

impl Fetcher for CacheDatabaseFetcher<'_> {
    fn fetch(
        &mut self,
        request: &CacheFetchRequest,
        columns: &ColumnSet,
        staging: &Connection,
    ) -> Result<u64, FetchFailure> {
        let mut staged = 0;
        for table in &columns.tables {
            staged += self
                .stage_table(request, table, staging)
                .map_err(|e| FetchFailure::new(request, format!("table '{}': {}", table.name, e)))?;
        }
        info!(
            "Staged {} rows for window starting {}",
            staged,
            Utils::format_date(&request.start)
        );
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission_window::PermissionWindow;
    use crate::progress::test_support::{control_with_load, date, events_table};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn request(start: &str) -> CacheFetchRequest {
        CacheFetchRequest {
            start: date(start),
            chunk_period: Duration::days(1),
            permission_window: PermissionWindow::unrestricted(),
        }
    }

    fn cache_with_events() -> Connection {
        let cache = Connection::open_in_memory().unwrap();
        cache
            .execute_batch(
                "CREATE TABLE events (id INTEGER PRIMARY KEY, event_date INTEGER, value TEXT);",
            )
            .unwrap();
        for (id, day) in [(1, "2001-01-01"), (2, "2001-01-01 23:59:59"), (3, "2001-01-02")] {
            cache
                .execute(
                    "INSERT INTO events VALUES (?, ?, ?)",
                    rusqlite::params![id, date(day).timestamp(), format!("v{}", id)],
                )
                .unwrap();
        }
        cache
    }

    #[test]
    fn test_copies_only_the_window() {
        let cache = cache_with_events();
        let staging = Connection::open_in_memory().unwrap();
        let columns = ColumnSet {
            tables: vec![events_table()],
        };

        let staged = CacheDatabaseFetcher::new(&cache)
            .fetch(&request("2001-01-01"), &columns, &staging)
            .unwrap();
        assert_eq!(staged, 2);

        let ids: Vec<i64> = staging
            .prepare("SELECT id FROM events ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_broken_cache_table_is_fetch_failure() {
        let cache = Connection::open_in_memory().unwrap();
        // No event_date column
        cache
            .execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY, value TEXT);")
            .unwrap();
        let staging = Connection::open_in_memory().unwrap();
        let columns = ColumnSet {
            tables: vec![events_table()],
        };

        let failure = CacheDatabaseFetcher::new(&cache)
            .fetch(&request("2001-01-01"), &columns, &staging)
            .unwrap_err();
        assert_eq!(failure.start, date("2001-01-01"));
        assert_eq!(failure.end, date("2001-01-02"));
        assert!(failure.message.contains("events"));
    }

    #[test]
    fn test_failures_are_recorded() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-01-05"), 1);
        let failure = FetchFailure::new(&request("2001-01-02"), "source offline");
        failure.record(&conn, id).unwrap();

        assert_eq!(FetchFailure::list_for(&conn, id).unwrap(), vec![failure]);
    }
}
