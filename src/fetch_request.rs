use chrono::{DateTime, Duration, Utc};

use crate::error::LoadError;
use crate::permission_window::PermissionWindow;
use crate::progress::{CacheProgress, LoadProgress};
use crate::utils::Utils;

/// One request to pull a window of source data. Built fresh for every
/// scheduling decision and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheFetchRequest {
    pub start: DateTime<Utc>,
    pub chunk_period: Duration,
    pub permission_window: PermissionWindow,
}

impl CacheFetchRequest {
    pub fn end(&self) -> DateTime<Utc> {
        Utils::add_saturating(self.start, self.chunk_period)
    }

    /// The consecutive request covering the next chunk
    pub fn next(&self) -> Self {
        Self {
            start: self.end(),
            chunk_period: self.chunk_period,
            permission_window: self.permission_window.clone(),
        }
    }

    /// True when the whole window lies at least `lag` behind `now`, i.e. the
    /// source is expected to have complete data for it.
    pub fn is_ready(&self, now: DateTime<Utc>, lag: Option<Duration>) -> bool {
        let horizon = Utils::sub_saturating(now, lag.unwrap_or_else(Duration::zero));
        self.end() <= horizon
    }

    pub fn is_permitted(&self, now: DateTime<Utc>) -> bool {
        self.permission_window.is_permitted(now)
    }
}

pub struct FetchRequestBuilder;

impl FetchRequestBuilder {
    /// Derive the next fetch request.
    ///
    /// The start is the cache fill progress when known (confirmed
    /// availability), falling back to the load's origin date. Fails when
    /// neither is set.
    pub fn create(
        cache: &CacheProgress,
        load: &LoadProgress,
    ) -> Result<CacheFetchRequest, LoadError> {
        let start = cache
            .cache_fill_progress
            .or(load.origin_date)
            .ok_or_else(|| {
                LoadError::Configuration(format!(
                    "Load '{}' has neither cache fill progress nor an origin date; cannot determine a start date",
                    load.name
                ))
            })?;

        Ok(CacheFetchRequest {
            start,
            chunk_period: cache.chunk_period,
            permission_window: cache
                .permission_window
                .clone()
                .unwrap_or_else(PermissionWindow::unrestricted),
        })
    }
}
