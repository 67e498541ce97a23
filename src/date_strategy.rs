use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::progress::LoadConfiguration;
use crate::utils::Utils;

/// How a load's run window is cut into sub-windows.
///
/// Stored as an integer in `load_progress.date_strategy`.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStrategy {
    /// Sub-windows of the cache chunk period, never past confirmed cache data
    #[default]
    CacheTracking = 0,
    /// The whole run window as a single sub-window
    ConsecutiveDays = 1,
}

impl DateStrategy {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => DateStrategy::CacheTracking,
            1 => DateStrategy::ConsecutiveDays,
            _ => {
                warn!(
                    "Invalid DateStrategy value in database: {}, defaulting to CacheTracking",
                    value
                );
                DateStrategy::CacheTracking
            }
        }
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            DateStrategy::CacheTracking => "Cache Tracking",
            DateStrategy::ConsecutiveDays => "Consecutive Days",
        }
    }

    /// Build the generator for `plan`
    pub fn generator(&self, plan: &LoadPlan, chunk_period: Duration) -> Box<dyn JobDateGenerator> {
        match self {
            DateStrategy::CacheTracking => Box::new(ChunkedWindows::new(plan, chunk_period)),
            DateStrategy::ConsecutiveDays => Box::new(ChunkedWindows::new(plan, plan.length())),
        }
    }
}

/// A half-open time range `[start, end)` processed as one fetch + migrate
/// unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LoadWindow {
    pub fn length(&self) -> Duration {
        self.end - self.start
    }
}

impl std::fmt::Display for LoadWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} .. {})",
            Utils::format_date(&self.start),
            Utils::format_date(&self.end)
        )
    }
}

/// Produces the next sub-window of a run, or `None` when the run is covered.
pub trait JobDateGenerator {
    fn next_window(&mut self) -> Option<LoadWindow>;
}

/// The total window a single run may load for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LoadPlan {
    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    /// Whole days covered by the plan
    pub fn days(&self) -> i64 {
        self.length().num_days()
    }

    /// Work out what a run should load for `config` at `now`.
    ///
    /// Starts at the load progress (or the origin date for a record never
    /// loaded), spans `default_days`, and is truncated to the ceiling: the
    /// cache fill progress for cache-backed loads, and `now - lag`. Returns
    /// `None` when nothing fits.
    pub fn for_configuration(
        config: &LoadConfiguration,
        now: DateTime<Utc>,
    ) -> Result<Option<LoadPlan>, LoadError> {
        let load = &config.load;
        let start = load
            .data_load_progress
            .or(load.origin_date)
            .ok_or_else(|| {
                LoadError::Configuration(format!(
                    "Load '{}' has neither load progress nor an origin date",
                    load.name
                ))
            })?;

        if load.default_days == 0 {
            return Ok(None);
        }

        let mut end = Utils::add_saturating(start, Duration::days(load.default_days as i64));

        let lag = config
            .cache
            .as_ref()
            .and_then(|c| c.lag_period)
            .unwrap_or_else(Duration::zero);
        end = end.min(Utils::sub_saturating(now, lag));

        if let Some(cache) = &config.cache {
            match cache.cache_fill_progress {
                Some(fill) => end = end.min(fill),
                None => return Ok(None),
            }
        }

        if end <= start {
            return Ok(None);
        }

        Ok(Some(LoadPlan { start, end }))
    }
}

/// Consecutive sub-windows of at most `chunk` covering a plan; the final one
/// is truncated to the plan end.
pub struct ChunkedWindows {
    cursor: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk: Duration,
}

impl ChunkedWindows {
    pub fn new(plan: &LoadPlan, chunk: Duration) -> Self {
        // A non-positive chunk would never advance; fall back to the whole plan
        let chunk = if chunk <= Duration::zero() {
            plan.length()
        } else {
            chunk
        };
        Self {
            cursor: plan.start,
            end: plan.end,
            chunk,
        }
    }
}

impl JobDateGenerator for ChunkedWindows {
    fn next_window(&mut self) -> Option<LoadWindow> {
        if self.cursor >= self.end {
            return None;
        }
        let window_end = Utils::add_saturating(self.cursor, self.chunk).min(self.end);
        let window = LoadWindow {
            start: self.cursor,
            end: window_end,
        };
        self.cursor = window_end;
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::test_support::*;
    use pretty_assertions::assert_eq;

    fn config(loaded: Option<&str>, cached: Option<&str>, days: u32) -> LoadConfiguration {
        let (conn, id) = control_with_load(loaded, cached, days);
        LoadConfiguration::get(&conn, id).unwrap().unwrap()
    }

    fn collect(mut generator: Box<dyn JobDateGenerator>) -> Vec<LoadWindow> {
        let mut windows = Vec::new();
        while let Some(w) = generator.next_window() {
            windows.push(w);
        }
        windows
    }

    #[test]
    fn test_plan_covers_full_chunk_when_cache_allows() {
        let config = config(Some("2001-01-01"), Some("2001-01-11"), 10);
        let plan = LoadPlan::for_configuration(&config, date("2030-01-01"))
            .unwrap()
            .unwrap();
        assert_eq!(plan.start, date("2001-01-01"));
        assert_eq!(plan.days(), 10);
    }

    #[test]
    fn test_plan_truncated_to_cache_fill() {
        let config = config(Some("2001-01-01"), Some("2001-01-04"), 10);
        let plan = LoadPlan::for_configuration(&config, date("2030-01-01"))
            .unwrap()
            .unwrap();
        assert_eq!(plan.end, date("2001-01-04"));
    }

    #[test]
    fn test_plan_truncated_to_lag_horizon() {
        let mut config = config(Some("2001-01-01"), Some("2001-01-11"), 10);
        if let Some(cache) = config.cache.as_mut() {
            cache.lag_period = Some(Duration::days(2));
        }
        let plan = LoadPlan::for_configuration(&config, date("2001-01-07"))
            .unwrap()
            .unwrap();
        assert_eq!(plan.end, date("2001-01-05"));
    }

    #[test]
    fn test_plan_none_when_nothing_available() {
        let no_cache_data = config(Some("2001-01-01"), None, 10);
        assert_eq!(
            LoadPlan::for_configuration(&no_cache_data, date("2030-01-01")).unwrap(),
            None
        );

        let caught_up = config(Some("2001-01-11"), Some("2001-01-11"), 10);
        assert_eq!(
            LoadPlan::for_configuration(&caught_up, date("2030-01-01")).unwrap(),
            None
        );

        let disabled = config(Some("2001-01-01"), Some("2001-01-11"), 0);
        assert_eq!(
            LoadPlan::for_configuration(&disabled, date("2030-01-01")).unwrap(),
            None
        );
    }

    #[test]
    fn test_plan_with_extreme_periods_does_not_overflow() {
        let mut config = config(Some("2001-01-01"), Some("2001-01-11"), u32::MAX);
        let plan = LoadPlan::for_configuration(&config, date("2030-01-01"))
            .unwrap()
            .unwrap();
        assert_eq!(plan.end, date("2001-01-11"));

        let windows = collect(
            DateStrategy::CacheTracking.generator(&plan, Duration::days(100_000_000)),
        );
        assert_eq!(windows, vec![LoadWindow { start: plan.start, end: plan.end }]);

        // A lag reaching past the start of time leaves nothing ready
        if let Some(cache) = config.cache.as_mut() {
            cache.lag_period = Some(Duration::days(100_000_000));
        }
        assert_eq!(
            LoadPlan::for_configuration(&config, date("2030-01-01")).unwrap(),
            None
        );
    }

    #[test]
    fn test_plan_uses_origin_when_never_loaded() {
        let config = config(None, Some("2001-01-03"), 10);
        let plan = LoadPlan::for_configuration(&config, date("2030-01-01"))
            .unwrap()
            .unwrap();
        assert_eq!(plan.start, date("2001-01-01"));
        assert_eq!(plan.end, date("2001-01-03"));
    }

    #[test]
    fn test_plan_without_start_is_configuration_error() {
        let mut config = config(None, Some("2001-01-03"), 10);
        config.load.origin_date = None;
        assert!(matches!(
            LoadPlan::for_configuration(&config, date("2030-01-01")),
            Err(LoadError::Configuration(_))
        ));
    }

    #[test]
    fn test_cache_tracking_windows_are_consecutive_chunks() {
        let plan = LoadPlan {
            start: date("2001-01-01"),
            end: date("2001-01-03 12:00:00"),
        };
        let windows = collect(DateStrategy::CacheTracking.generator(&plan, Duration::days(1)));
        assert_eq!(
            windows,
            vec![
                LoadWindow { start: date("2001-01-01"), end: date("2001-01-02") },
                LoadWindow { start: date("2001-01-02"), end: date("2001-01-03") },
                LoadWindow { start: date("2001-01-03"), end: date("2001-01-03 12:00:00") },
            ]
        );
    }

    #[test]
    fn test_consecutive_days_single_window() {
        let plan = LoadPlan {
            start: date("2001-01-01"),
            end: date("2001-01-11"),
        };
        let windows = collect(DateStrategy::ConsecutiveDays.generator(&plan, Duration::days(1)));
        assert_eq!(
            windows,
            vec![LoadWindow { start: date("2001-01-01"), end: date("2001-01-11") }]
        );
    }

    #[test]
    fn test_date_strategy_from_i64() {
        assert_eq!(DateStrategy::from_i64(0), DateStrategy::CacheTracking);
        assert_eq!(DateStrategy::from_i64(1), DateStrategy::ConsecutiveDays);
        assert_eq!(DateStrategy::from_i64(7), DateStrategy::CacheTracking);
    }
}
