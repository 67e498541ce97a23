use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::date_strategy::DateStrategy;
use crate::error::LoadError;
use crate::migration::{ColumnSet, TableSpec};
use crate::permission_window::PermissionWindow;
use crate::utils::Utils;

/// How far the cache has confirmed availability of source data.
///
/// Owned 1:1 by a [`LoadProgress`]. `cache_fill_progress` only ever moves
/// forward.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheProgress {
    pub cache_progress_id: i64,
    pub load_progress_id: i64,
    pub cache_fill_progress: Option<DateTime<Utc>>,
    pub chunk_period: Duration,
    pub lag_period: Option<Duration>,
    pub permission_window: Option<PermissionWindow>,
}

/// How far the load into the live store has advanced.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub load_progress_id: i64,
    pub name: String,
    pub origin_date: Option<DateTime<Utc>>,
    pub data_load_progress: Option<DateTime<Utc>>,
    pub default_days: u32,
    pub date_strategy: DateStrategy,
    pub is_locked: bool,
}

/// Everything the scheduler needs about one load: both progress records and
/// the tables the load writes.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfiguration {
    pub load: LoadProgress,
    pub cache: Option<CacheProgress>,
    pub columns: ColumnSet,
}

/// Parameters for creating a load progress record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoadProgress {
    pub name: String,
    pub origin_date: Option<DateTime<Utc>>,
    pub data_load_progress: Option<DateTime<Utc>>,
    pub default_days: u32,
    pub date_strategy: DateStrategy,
}

/// Parameters for creating the cache progress of a load
#[derive(Debug, Clone)]
pub struct NewCacheProgress {
    pub cache_fill_progress: Option<DateTime<Utc>>,
    pub chunk_period: Duration,
    pub lag_period: Option<Duration>,
    pub permission_window_id: Option<i64>,
}

impl LoadProgress {
    /// Lock identity of the record itself
    pub fn entity(load_progress_id: i64) -> String {
        format!("load_progress:{}", load_progress_id)
    }

    pub fn create(conn: &Connection, params: &NewLoadProgress) -> Result<i64, LoadError> {
        let load_progress_id: i64 = conn.query_row(
            "INSERT INTO load_progress (name, origin_date, data_load_progress, default_days, date_strategy)
             VALUES (?, ?, ?, ?, ?)
             RETURNING load_progress_id",
            rusqlite::params![
                params.name,
                params.origin_date.map(|d| d.timestamp()),
                params.data_load_progress.map(|d| d.timestamp()),
                params.default_days,
                params.date_strategy.as_i64(),
            ],
            |row| row.get(0),
        )?;

        info!(
            "Created load progress {} ('{}')",
            load_progress_id, params.name
        );
        Ok(load_progress_id)
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(LoadProgress {
            load_progress_id: row.get(0)?,
            name: row.get(1)?,
            origin_date: Utils::opt_timestamp(row.get(2)?, 2)?,
            data_load_progress: Utils::opt_timestamp(row.get(3)?, 3)?,
            default_days: row.get(4)?,
            date_strategy: DateStrategy::from_i64(row.get(5)?),
            is_locked: row.get(6)?,
        })
    }

    pub fn get_by_id(conn: &Connection, load_progress_id: i64) -> Result<Option<Self>, LoadError> {
        conn.query_row(
            "SELECT load_progress_id, name, origin_date, data_load_progress,
                    default_days, date_strategy, is_locked
             FROM load_progress
             WHERE load_progress_id = ?",
            [load_progress_id],
            Self::from_row,
        )
        .optional()
        .map_err(LoadError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, LoadError> {
        let mut stmt = conn.prepare(
            "SELECT load_progress_id, name, origin_date, data_load_progress,
                    default_days, date_strategy, is_locked
             FROM load_progress
             ORDER BY load_progress_id",
        )?;

        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Advance `data_load_progress` to `to`.
    ///
    /// Called only after the sub-window ending at `to` has been committed.
    /// Moving backwards is rejected.
    pub fn advance(
        conn: &Connection,
        load_progress_id: i64,
        to: DateTime<Utc>,
    ) -> Result<(), LoadError> {
        let current = Self::get_by_id(conn, load_progress_id)?.ok_or_else(|| {
            LoadError::Error(format!("Load progress {} not found", load_progress_id))
        })?;

        if let Some(existing) = current.data_load_progress {
            if to < existing {
                return Err(LoadError::Error(format!(
                    "Refusing to move load progress {} backwards from {} to {}",
                    load_progress_id,
                    Utils::format_date(&existing),
                    Utils::format_date(&to)
                )));
            }
        }

        conn.execute(
            "UPDATE load_progress SET data_load_progress = ? WHERE load_progress_id = ?",
            rusqlite::params![to.timestamp(), load_progress_id],
        )?;
        Ok(())
    }
}

impl CacheProgress {
    pub fn create(
        conn: &Connection,
        load_progress_id: i64,
        params: &NewCacheProgress,
    ) -> Result<i64, LoadError> {
        if params.chunk_period <= Duration::zero() {
            return Err(LoadError::Configuration(format!(
                "Chunk period must be positive, got {}s",
                params.chunk_period.num_seconds()
            )));
        }

        let cache_progress_id: i64 = conn.query_row(
            "INSERT INTO cache_progress (load_progress_id, cache_fill_progress, chunk_period, lag_period, permission_window_id)
             VALUES (?, ?, ?, ?, ?)
             RETURNING cache_progress_id",
            rusqlite::params![
                load_progress_id,
                params.cache_fill_progress.map(|d| d.timestamp()),
                params.chunk_period.num_seconds(),
                params.lag_period.map(|d| d.num_seconds()),
                params.permission_window_id,
            ],
            |row| row.get(0),
        )?;

        Ok(cache_progress_id)
    }

    pub fn get_for_load(
        conn: &Connection,
        load_progress_id: i64,
    ) -> Result<Option<Self>, LoadError> {
        let row = conn
            .query_row(
                "SELECT cache_progress_id, load_progress_id, cache_fill_progress,
                        chunk_period, lag_period, permission_window_id
                 FROM cache_progress
                 WHERE load_progress_id = ?",
                [load_progress_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        Utils::opt_timestamp(row.get(2)?, 2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;

        let (cache_progress_id, load_progress_id, fill, chunk_secs, lag_secs, window_id) = match row
        {
            Some(r) => r,
            None => return Ok(None),
        };

        let permission_window = match window_id {
            Some(window_id) => {
                let window = PermissionWindow::get_by_id(conn, window_id)?;
                if window.is_none() {
                    warn!(
                        "Cache progress {} references missing permission window {}",
                        cache_progress_id, window_id
                    );
                }
                window
            }
            None => None,
        };

        Ok(Some(CacheProgress {
            cache_progress_id,
            load_progress_id,
            cache_fill_progress: fill,
            chunk_period: Duration::seconds(chunk_secs),
            lag_period: lag_secs.map(Duration::seconds),
            permission_window,
        }))
    }

    /// Record that the cache now holds confirmed data up to `to`.
    ///
    /// Called by the fetch side. Regressions are rejected; recording the
    /// current value again is a no-op.
    pub fn record_fill(
        conn: &Connection,
        load_progress_id: i64,
        to: DateTime<Utc>,
    ) -> Result<(), LoadError> {
        let current = Self::get_for_load(conn, load_progress_id)?.ok_or_else(|| {
            LoadError::Error(format!(
                "Load progress {} has no cache progress",
                load_progress_id
            ))
        })?;

        if let Some(existing) = current.cache_fill_progress {
            if to < existing {
                return Err(LoadError::Error(format!(
                    "Refusing to move cache progress of load {} backwards from {} to {}",
                    load_progress_id,
                    Utils::format_date(&existing),
                    Utils::format_date(&to)
                )));
            }
        }

        conn.execute(
            "UPDATE cache_progress SET cache_fill_progress = ? WHERE load_progress_id = ?",
            rusqlite::params![to.timestamp(), load_progress_id],
        )?;
        Ok(())
    }
}

impl LoadConfiguration {
    /// Lock identities of everything this load touches: the progress record
    /// and each live table.
    pub fn participating_entities(&self) -> Vec<String> {
        let mut entities = vec![LoadProgress::entity(self.load.load_progress_id)];
        entities.extend(self.columns.tables.iter().map(TableSpec::entity));
        entities
    }

    pub fn add_table(
        conn: &Connection,
        load_progress_id: i64,
        position: i64,
        table: &TableSpec,
    ) -> Result<(), LoadError> {
        table.validate()
            .map_err(|e| LoadError::Configuration(format!("Invalid table '{}': {}", table.name, e)))?;

        conn.execute(
            "INSERT INTO load_tables (load_progress_id, table_name, position, primary_key, columns, date_column)
             VALUES (?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                load_progress_id,
                table.name,
                position,
                serde_json::to_string(&table.primary_key)?,
                serde_json::to_string(&table.columns)?,
                table.date_column,
            ],
        )?;
        Ok(())
    }

    fn load_columns(conn: &Connection, load_progress_id: i64) -> Result<ColumnSet, LoadError> {
        let mut stmt = conn.prepare(
            "SELECT table_name, primary_key, columns, date_column
             FROM load_tables
             WHERE load_progress_id = ?
             ORDER BY position, table_name",
        )?;

        let rows = stmt
            .query_map([load_progress_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(rows.len());
        for (name, pk_json, columns_json, date_column) in rows {
            tables.push(TableSpec {
                name,
                primary_key: serde_json::from_str(&pk_json)?,
                columns: serde_json::from_str(&columns_json)?,
                date_column,
            });
        }

        Ok(ColumnSet { tables })
    }

    pub fn get(conn: &Connection, load_progress_id: i64) -> Result<Option<Self>, LoadError> {
        let load = match LoadProgress::get_by_id(conn, load_progress_id)? {
            Some(load) => load,
            None => return Ok(None),
        };
        Self::assemble(conn, load).map(Some)
    }

    /// All load configurations in id order
    pub fn list(conn: &Connection) -> Result<Vec<Self>, LoadError> {
        LoadProgress::list(conn)?
            .into_iter()
            .map(|load| Self::assemble(conn, load))
            .collect()
    }

    fn assemble(conn: &Connection, load: LoadProgress) -> Result<Self, LoadError> {
        let cache = CacheProgress::get_for_load(conn, load.load_progress_id)?;
        let columns = Self::load_columns(conn, load.load_progress_id)?;
        Ok(LoadConfiguration {
            load,
            cache,
            columns,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_load_configuration_round_trip() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-01-11"), 10);

        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();
        assert_eq!(config.load.name, "events");
        assert_eq!(config.load.default_days, 10);
        assert_eq!(config.load.data_load_progress, Some(date("2001-01-01")));
        assert!(!config.load.is_locked);

        let cache = config.cache.unwrap();
        assert_eq!(cache.cache_fill_progress, Some(date("2001-01-11")));
        assert_eq!(cache.chunk_period, Duration::days(1));
        assert_eq!(cache.lag_period, None);
        assert_eq!(cache.permission_window, None);

        assert_eq!(config.columns.tables, vec![events_table()]);
    }

    #[test]
    fn test_participating_entities() {
        let (conn, id) = control_with_load(None, None, 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();
        assert_eq!(
            config.participating_entities(),
            vec![format!("load_progress:{}", id), "table:events".to_string()]
        );
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (conn, id) = control_with_load(Some("2001-01-05"), None, 1);

        LoadProgress::advance(&conn, id, date("2001-01-06")).unwrap();
        let progress = LoadProgress::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(progress.data_load_progress, Some(date("2001-01-06")));

        let result = LoadProgress::advance(&conn, id, date("2001-01-02"));
        assert!(result.is_err());
        let progress = LoadProgress::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(progress.data_load_progress, Some(date("2001-01-06")));
    }

    #[test]
    fn test_record_fill_is_monotonic() {
        let (conn, id) = control_with_load(None, Some("2001-01-05"), 1);

        CacheProgress::record_fill(&conn, id, date("2001-01-05")).unwrap();
        CacheProgress::record_fill(&conn, id, date("2001-02-01")).unwrap();
        assert!(CacheProgress::record_fill(&conn, id, date("2001-01-01")).is_err());

        let cache = CacheProgress::get_for_load(&conn, id).unwrap().unwrap();
        assert_eq!(cache.cache_fill_progress, Some(date("2001-02-01")));
    }

    #[test]
    fn test_cache_progress_rejects_non_positive_chunk() {
        let (conn, _) = control_with_load(None, None, 1);
        let other = LoadProgress::create(
            &conn,
            &NewLoadProgress {
                name: "other".into(),
                origin_date: None,
                data_load_progress: None,
                default_days: 1,
                date_strategy: DateStrategy::ConsecutiveDays,
            },
        )
        .unwrap();

        let result = CacheProgress::create(
            &conn,
            other,
            &NewCacheProgress {
                cache_fill_progress: None,
                chunk_period: Duration::zero(),
                lag_period: None,
                permission_window_id: None,
            },
        );
        assert!(matches!(result, Err(LoadError::Configuration(_))));
    }

    #[test]
    fn test_list_in_id_order() {
        let (conn, first) = control_with_load(None, None, 1);
        let second = LoadProgress::create(
            &conn,
            &NewLoadProgress {
                name: "second".into(),
                origin_date: None,
                data_load_progress: None,
                default_days: 3,
                date_strategy: DateStrategy::ConsecutiveDays,
            },
        )
        .unwrap();

        let configs = LoadConfiguration::list(&conn).unwrap();
        let ids: Vec<i64> = configs.iter().map(|c| c.load.load_progress_id).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(configs[1].cache.is_none());
        assert!(configs[1].columns.tables.is_empty());
    }
}
