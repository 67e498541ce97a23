use log::info;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::date_strategy::DateStrategy;
use crate::error::LoadError;
use crate::migration::TableSpec;
use crate::permission_window::PermissionWindow;
use crate::progress::{
    CacheProgress, LoadConfiguration, LoadProgress, NewCacheProgress, NewLoadProgress,
};
use crate::utils::Utils;

/// Cache side of a load definition. Durations use `Utils::parse_duration`
/// syntax (`1d`, `6h`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDefinition {
    pub cache_fill_progress: Option<String>,
    pub chunk_period: String,
    pub lag_period: Option<String>,
    pub permission_window: Option<PermissionWindow>,
}

/// A load as written by an operator, e.g.:
///
/// ```toml
/// name = "events"
/// origin_date = "2001-01-01"
/// default_days = 10
///
/// [cache]
/// chunk_period = "1d"
/// lag_period = "6h"
///
/// [[tables]]
/// name = "events"
/// primary_key = ["id"]
/// columns = ["id", "event_date", "value"]
/// date_column = "event_date"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadDefinition {
    pub name: String,
    pub origin_date: Option<String>,
    pub data_load_progress: Option<String>,
    pub default_days: u32,
    #[serde(default)]
    pub date_strategy: DateStrategy,
    pub cache: Option<CacheDefinition>,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl LoadDefinition {
    pub fn from_toml(text: &str) -> Result<Self, LoadError> {
        toml::from_str(text)
            .map_err(|e| LoadError::Configuration(format!("Invalid load definition: {}", e)))
    }

    /// Register the load and everything it owns in one transaction
    pub fn apply(&self, conn: &Connection) -> Result<LoadConfiguration, LoadError> {
        let parse_opt_date =
            |value: &Option<String>| value.as_deref().map(Utils::parse_date).transpose();

        let new_load = NewLoadProgress {
            name: self.name.clone(),
            origin_date: parse_opt_date(&self.origin_date)?,
            data_load_progress: parse_opt_date(&self.data_load_progress)?,
            default_days: self.default_days,
            date_strategy: self.date_strategy,
        };

        let new_cache = match &self.cache {
            Some(cache) => Some((
                NewCacheProgress {
                    cache_fill_progress: parse_opt_date(&cache.cache_fill_progress)?,
                    chunk_period: Utils::parse_duration(&cache.chunk_period)?,
                    lag_period: cache
                        .lag_period
                        .as_deref()
                        .map(Utils::parse_duration)
                        .transpose()?,
                    permission_window_id: None,
                },
                cache.permission_window.as_ref(),
            )),
            None => None,
        };

        let load_progress_id = Database::immediate_transaction(conn, |c| {
            let load_progress_id = LoadProgress::create(c, &new_load)?;

            if let Some((mut new_cache, window)) = new_cache {
                if let Some(window) = window {
                    new_cache.permission_window_id = Some(PermissionWindow::create(c, window)?);
                }
                CacheProgress::create(c, load_progress_id, &new_cache)?;
            }

            for (position, table) in self.tables.iter().enumerate() {
                LoadConfiguration::add_table(c, load_progress_id, position as i64, table)?;
            }
            Ok(load_progress_id)
        })?;

        info!("Defined load '{}' as {}", self.name, load_progress_id);

        LoadConfiguration::get(conn, load_progress_id)?.ok_or_else(|| {
            LoadError::Error(format!("Load {} vanished after creation", load_progress_id))
        })
    }
}
