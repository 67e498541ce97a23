use chrono::Duration;
use log::debug;

use crate::locks::LockSet;
use crate::progress::LoadConfiguration;
use crate::utils::Utils;

/// Why a configuration was passed over. Used for logging and `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    NoCacheProgress,
    CacheNeverFilled,
    NeverLoaded,
    ChunkDisabled,
    InsufficientCache,
    Locked,
}

impl Ineligibility {
    pub fn describe(&self) -> &'static str {
        match self {
            Ineligibility::NoCacheProgress => "no cache progress",
            Ineligibility::CacheNeverFilled => "cache has never produced data",
            Ineligibility::NeverLoaded => "never loaded (first run must be manual)",
            Ineligibility::ChunkDisabled => "days to load is zero",
            Ineligibility::InsufficientCache => "not enough cached data for a full chunk",
            Ineligibility::Locked => "locked by another job",
        }
    }
}

/// Side-effect free scan for loads that can run now.
///
/// Iteration order decides: the first eligible configuration wins. No
/// priority or fairness is applied.
pub struct RunEligibilityFinder;

impl RunEligibilityFinder {
    /// Check one configuration against the eligibility rules
    pub fn check(config: &LoadConfiguration, locked: &LockSet) -> Result<(), Ineligibility> {
        Self::check_progress(config)?;

        if config.load.is_locked
            || config
                .participating_entities()
                .iter()
                .any(|entity| locked.contains(entity))
        {
            return Err(Ineligibility::Locked);
        }

        Ok(())
    }

    /// The cache and load progress rules alone, ignoring locks. Used to
    /// re-check a record once this process holds its lock.
    pub fn check_progress(config: &LoadConfiguration) -> Result<(), Ineligibility> {
        let cache = config.cache.as_ref().ok_or(Ineligibility::NoCacheProgress)?;
        let cache_fill = cache
            .cache_fill_progress
            .ok_or(Ineligibility::CacheNeverFilled)?;
        let loaded = config
            .load
            .data_load_progress
            .ok_or(Ineligibility::NeverLoaded)?;

        let days_to_load = config.load.default_days;
        if days_to_load == 0 {
            return Err(Ineligibility::ChunkDisabled);
        }

        let chunk_end = Utils::add_saturating(loaded, Duration::days(days_to_load as i64));
        if chunk_end > cache_fill {
            return Err(Ineligibility::InsufficientCache);
        }

        Ok(())
    }

    /// The first eligible configuration, if any
    pub fn find_eligible<'a>(
        configs: &'a [LoadConfiguration],
        locked: &LockSet,
    ) -> Option<&'a LoadConfiguration> {
        configs.iter().find(|config| Self::is_eligible(config, locked))
    }

    /// Every eligible configuration, in iteration order
    pub fn find_all_eligible<'a>(
        configs: &'a [LoadConfiguration],
        locked: &LockSet,
    ) -> Vec<&'a LoadConfiguration> {
        configs
            .iter()
            .filter(|config| Self::is_eligible(config, locked))
            .collect()
    }

    fn is_eligible(config: &LoadConfiguration, locked: &LockSet) -> bool {
        match Self::check(config, locked) {
            Ok(()) => true,
            Err(reason) => {
                debug!(
                    "Load '{}' not eligible: {}",
                    config.load.name,
                    reason.describe()
                );
                false
            }
        }
    }
}
