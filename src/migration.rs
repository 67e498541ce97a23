use log::{debug, info, warn};
use rusqlite::{types::Value, Connection};
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationSignal;
use crate::database::Database;
use crate::error::LoadError;

/// A live table written by a load, and how its rows are matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub primary_key: Vec<String>,
    pub columns: Vec<String>,
    /// Column holding the row's timestamp (unix seconds). Tables without one
    /// are copied whole for every window.
    #[serde(default)]
    pub date_column: Option<String>,
}

impl TableSpec {
    /// Lock identity of the live table
    pub fn entity(&self) -> String {
        format!("table:{}", self.name)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_identifier(&self.name)?;

        if self.columns.is_empty() {
            return Err("At least one column is required".to_string());
        }
        for column in &self.columns {
            validate_identifier(column)?;
        }

        if self.primary_key.is_empty() {
            return Err("A primary key is required".to_string());
        }
        for key in &self.primary_key {
            if !self.columns.contains(key) {
                return Err(format!("Primary key column '{}' is not in the column list", key));
            }
        }

        if let Some(date_column) = &self.date_column {
            if !self.columns.contains(date_column) {
                return Err(format!("Date column '{}' is not in the column list", date_column));
            }
        }

        Ok(())
    }

    fn value_columns(&self) -> Vec<&String> {
        self.columns
            .iter()
            .filter(|c| !self.primary_key.contains(c))
            .collect()
    }

    pub(crate) fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn placeholders(&self) -> String {
        vec!["?"; self.columns.len()].join(", ")
    }
}

/// The tables one migration unit covers, in migration order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnSet {
    pub tables: Vec<TableSpec>,
}

impl ColumnSet {
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

fn validate_identifier(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Identifier must not be empty".to_string());
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "Identifier '{}' must contain only ASCII letters, digits and '_'",
            name
        ));
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, LoadError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

/// Insert/update counts for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMigration {
    pub table_name: String,
    pub inserts: u64,
    pub updates: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationTotals {
    pub inserts: u64,
    pub updates: u64,
}

impl MigrationTotals {
    fn add(&mut self, table: &TableMigration) {
        self.inserts += table.inserts;
        self.updates += table.updates;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Committed,
    /// Cooperative cancellation seen between tables; nothing was committed
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub status: MigrationStatus,
    pub tables: Vec<TableMigration>,
}

impl MigrationOutcome {
    pub fn totals(&self) -> MigrationTotals {
        let mut totals = MigrationTotals::default();
        for table in &self.tables {
            totals.add(table);
        }
        totals
    }
}

/// Moves one staged unit into the live store.
pub struct MigrationTransaction;

impl MigrationTransaction {
    /// Upsert every staged row of `columns` into `live` inside a single
    /// transaction.
    ///
    /// `on_table` is called after each table with that table's counts and
    /// the running totals. Cancellation is checked before each table; when
    /// seen the transaction is rolled back and the outcome is `Cancelled`.
    /// After a commit the staging tables are emptied.
    pub fn migrate(
        staging: &Connection,
        live: &Connection,
        columns: &ColumnSet,
        cancel: &CancellationSignal,
        on_table: &mut dyn FnMut(&TableMigration, &MigrationTotals),
    ) -> Result<MigrationOutcome, LoadError> {
        for table in &columns.tables {
            table
                .validate()
                .map_err(|e| LoadError::Configuration(format!("Table '{}': {}", table.name, e)))?;
        }

        let staged = Self::staged_row_count(staging, columns)?;
        if staged == 0 {
            return Err(LoadError::SourceEmpty {
                tables: columns.table_names(),
            });
        }
        debug!("Migrating {} staged rows", staged);

        live.execute_batch("BEGIN IMMEDIATE")?;

        let mut tables = Vec::with_capacity(columns.tables.len());
        let mut totals = MigrationTotals::default();

        for table in &columns.tables {
            if cancel.is_cancelled() {
                info!(
                    "Migration cancelled before table '{}'; rolling back",
                    table.name
                );
                live.execute_batch("ROLLBACK")?;
                return Ok(MigrationOutcome {
                    status: MigrationStatus::Cancelled,
                    tables,
                });
            }

            match Self::upsert_table(staging, live, table) {
                Ok(counts) => {
                    totals.add(&counts);
                    on_table(&counts, &totals);
                    tables.push(counts);
                }
                Err(e) => return Err(Database::rollback_after(live, e)),
            }
        }

        Database::commit(live)?;

        Self::clear_staging(staging, columns)?;

        info!(
            "Migration committed: {} inserted, {} updated across {} tables",
            totals.inserts,
            totals.updates,
            tables.len()
        );

        Ok(MigrationOutcome {
            status: MigrationStatus::Committed,
            tables,
        })
    }

    /// Empty the staging tables of `columns`
    pub fn clear_staging(staging: &Connection, columns: &ColumnSet) -> Result<(), LoadError> {
        for table in &columns.tables {
            if table_exists(staging, &table.name)? {
                staging.execute(&format!("DELETE FROM {}", quote(&table.name)), [])?;
            }
        }
        Ok(())
    }

    /// Rows staged across all tables. Missing staging tables count as empty.
    pub fn staged_row_count(staging: &Connection, columns: &ColumnSet) -> Result<u64, LoadError> {
        let mut total = 0u64;
        for table in &columns.tables {
            if !table_exists(staging, &table.name)? {
                warn!("Staging table '{}' does not exist", table.name);
                continue;
            }
            let count: i64 = staging.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote(&table.name)),
                [],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }

    fn upsert_table(
        staging: &Connection,
        live: &Connection,
        table: &TableSpec,
    ) -> Result<TableMigration, LoadError> {
        let mut counts = TableMigration {
            table_name: table.name.clone(),
            inserts: 0,
            updates: 0,
        };

        if !table_exists(staging, &table.name)? {
            return Ok(counts);
        }

        let mut select = staging.prepare(&format!(
            "SELECT {} FROM {}",
            table.column_list(),
            quote(&table.name)
        ))?;
        let column_count = table.columns.len();
        let rows = select
            .query_map([], |row| {
                (0..column_count)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let value_columns = table.value_columns();
        let key_clause = table
            .primary_key
            .iter()
            .map(|k| format!("{} = ?", quote(k)))
            .collect::<Vec<_>>()
            .join(" AND ");

        // With no value columns a matching row is already up to date
        let match_sql = if value_columns.is_empty() {
            format!(
                "SELECT COUNT(*) FROM {} WHERE {}",
                quote(&table.name),
                key_clause
            )
        } else {
            format!(
                "UPDATE {} SET {} WHERE {}",
                quote(&table.name),
                value_columns
                    .iter()
                    .map(|c| format!("{} = ?", quote(c)))
                    .collect::<Vec<_>>()
                    .join(", "),
                key_clause
            )
        };
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&table.name),
            table.column_list(),
            table.placeholders()
        );

        let mut match_stmt = live.prepare(&match_sql)?;
        let mut insert_stmt = live.prepare(&insert_sql)?;

        let index_of = |name: &String| table.columns.iter().position(|c| c == name);
        let key_idx: Vec<usize> = table.primary_key.iter().filter_map(index_of).collect();
        let value_idx: Vec<usize> = value_columns.iter().filter_map(|c| index_of(*c)).collect();

        for row in &rows {
            let matched = if value_columns.is_empty() {
                let params = key_idx.iter().map(|&i| &row[i]);
                let count: i64 =
                    match_stmt.query_row(rusqlite::params_from_iter(params), |r| r.get(0))?;
                count > 0
            } else {
                let params = value_idx.iter().chain(key_idx.iter()).map(|&i| &row[i]);
                match_stmt.execute(rusqlite::params_from_iter(params))? > 0
            };

            if matched {
                counts.updates += 1;
            } else {
                insert_stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                counts.inserts += 1;
            }
        }

        debug!(
            "Table '{}': {} inserted, {} updated",
            table.name, counts.inserts, counts.updates
        );
        Ok(counts)
    }
}
