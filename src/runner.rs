use chrono::{DateTime, Utc};
use log::{debug, error, info, warn, Level};
use logging_timer::timer;

use crate::audit::SqliteAuditLog;
use crate::cancellation::{CancelReason, CancellationSignal};
use crate::date_strategy::LoadPlan;
use crate::eligibility::RunEligibilityFinder;
use crate::error::LoadError;
use crate::exit_code::ExitCode;
use crate::fetcher::Fetcher;
use crate::load_job::{LoadJob, LoadStores};
use crate::locks::{LockManager, LockSet};
use crate::progress::{LoadConfiguration, LoadProgress};
use crate::utils::Utils;

/// What a scheduler invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub exit_code: ExitCode,
    /// Load progress records that were locked and driven
    pub load_progress_ids: Vec<i64>,
    pub windows_committed: u32,
}

impl RunReport {
    fn nothing_to_do() -> Self {
        RunReport {
            exit_code: ExitCode::OperationNotRequired,
            load_progress_ids: Vec::new(),
            windows_committed: 0,
        }
    }
}

/// How the sub-window loop of one record ended.
enum LoopEnd {
    /// The generator ran out, or a job had nothing to do
    Exhausted,
    /// Stop every record now and report this code
    Stop(ExitCode),
}

/// Drives due loads through their sub-windows, one fetch + migrate job at a
/// time, while holding their locks.
pub struct ChunkedScheduleRunner<'a> {
    stores: LoadStores<'a>,
    fetcher: &'a mut dyn Fetcher,
    holder: String,
    max_records: usize,
}

impl<'a> ChunkedScheduleRunner<'a> {
    pub fn new(stores: LoadStores<'a>, fetcher: &'a mut dyn Fetcher, holder: &str) -> Self {
        Self {
            stores,
            fetcher,
            holder: holder.to_string(),
            max_records: 0,
        }
    }

    /// Cap the number of records driven per invocation (0 = no cap)
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn run(&mut self, cancel: &CancellationSignal) -> Result<RunReport, LoadError> {
        self.run_at(cancel, Utc::now())
    }

    /// One scheduler invocation as of `now`.
    ///
    /// Due records are claimed and driven one at a time, in scan order. A
    /// record another job claimed since the scan is skipped. Each record's
    /// locks are released before the next is claimed, on every exit path:
    /// explicitly on normal exit, by the guard's `Drop` when an error
    /// propagates.
    pub fn run_at(
        &mut self,
        cancel: &CancellationSignal,
        now: DateTime<Utc>,
    ) -> Result<RunReport, LoadError> {
        let control = self.stores.control;

        let configs = {
            let _tmr = timer!(Level::Trace; "ChunkedScheduleRunner::scan");
            let configs = LoadConfiguration::list(control)?;
            let locked = LockManager::locked_entities(control)?;
            if !locked.is_empty() {
                debug!("{} entities are held by other jobs", locked.len());
            }
            self.select_due(&configs, &locked, now)
        };

        if configs.is_empty() {
            info!("No loads are due");
            return Ok(RunReport::nothing_to_do());
        }

        let mut report = RunReport::nothing_to_do();
        let mut stopped_with = None;
        for scanned in &configs {
            match self.run_record(scanned, cancel, now, &mut report)? {
                LoopEnd::Exhausted => {}
                LoopEnd::Stop(code) => {
                    stopped_with = Some(code);
                    break;
                }
            }
        }

        report.exit_code = match stopped_with {
            Some(code) => code,
            None if report.windows_committed > 0 => ExitCode::Success,
            None => ExitCode::OperationNotRequired,
        };

        info!(
            "Run finished: {} ({} windows committed)",
            report.exit_code, report.windows_committed
        );
        Ok(report)
    }

    /// Claim one scanned record, re-read it under the lock and drive it
    fn run_record(
        &mut self,
        scanned: &LoadConfiguration,
        cancel: &CancellationSignal,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<LoopEnd, LoadError> {
        let control = self.stores.control;
        let id = scanned.load.load_progress_id;

        if let Some(code) = Self::stop_code(cancel) {
            info!("Run stopped before load '{}'", scanned.load.name);
            return Ok(LoopEnd::Stop(code));
        }

        let guard = match LockManager::acquire(control, scanned, &self.holder)? {
            Some(guard) => guard,
            None => {
                info!(
                    "Load '{}' was claimed by another job after the scan; skipping",
                    scanned.load.name
                );
                return Ok(LoopEnd::Exhausted);
            }
        };

        // Another runner may have advanced the record between scan and claim
        let config = match LoadConfiguration::get(control, id)? {
            Some(config) => config,
            None => {
                warn!("Load progress {} disappeared after the scan", id);
                guard.release()?;
                return Ok(LoopEnd::Exhausted);
            }
        };
        if let Err(reason) = RunEligibilityFinder::check_progress(&config) {
            info!(
                "Load '{}' is no longer due: {}",
                config.load.name,
                reason.describe()
            );
            guard.release()?;
            return Ok(LoopEnd::Exhausted);
        }

        report.load_progress_ids.push(id);
        let end = self.drive(&config, cancel, now, report)?;
        guard.release()?;
        Ok(end)
    }

    fn stop_code(cancel: &CancellationSignal) -> Option<ExitCode> {
        match cancel.reason() {
            Some(CancelReason::Hard) => Some(ExitCode::Abort),
            Some(CancelReason::Cooperative) => Some(ExitCode::Success),
            None => None,
        }
    }

    /// Eligible records whose permission window allows running now
    fn select_due(
        &self,
        configs: &[LoadConfiguration],
        locked: &LockSet,
        now: DateTime<Utc>,
    ) -> Vec<LoadConfiguration> {
        let mut due: Vec<LoadConfiguration> = RunEligibilityFinder::find_all_eligible(configs, locked)
            .into_iter()
            .filter(|config| {
                let permitted = config
                    .cache
                    .as_ref()
                    .and_then(|c| c.permission_window.as_ref())
                    .map_or(true, |w| w.is_permitted(now));
                if !permitted {
                    info!(
                        "Load '{}' is due but its permission window does not allow running now",
                        config.load.name
                    );
                }
                permitted
            })
            .cloned()
            .collect();

        if self.max_records > 0 {
            due.truncate(self.max_records);
        }
        due
    }

    /// Run the sub-window loop for one record
    fn drive(
        &mut self,
        config: &LoadConfiguration,
        cancel: &CancellationSignal,
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<LoopEnd, LoadError> {
        let plan = match LoadPlan::for_configuration(config, now)? {
            Some(plan) => plan,
            None => {
                info!("Load '{}' has nothing to load", config.load.name);
                return Ok(LoopEnd::Exhausted);
            }
        };

        let chunk_period = match &config.cache {
            Some(cache) => cache.chunk_period,
            None => plan.length(),
        };
        let mut generator = config.load.date_strategy.generator(&plan, chunk_period);
        let audit = SqliteAuditLog::new(self.stores.control);

        info!(
            "Loading '{}' from {} for {} days",
            config.load.name,
            Utils::format_date(&plan.start),
            plan.days()
        );

        while let Some(window) = generator.next_window() {
            match cancel.reason() {
                Some(CancelReason::Hard) => {
                    warn!("Run aborted before window {}", window);
                    return Ok(LoopEnd::Stop(ExitCode::Abort));
                }
                Some(CancelReason::Cooperative) => {
                    info!("Run stopped before window {}; committed work stands", window);
                    return Ok(LoopEnd::Stop(ExitCode::Success));
                }
                None => {}
            }

            let job = LoadJob::new(config, window);
            let code = match job.execute(self.stores, &mut *self.fetcher, &audit, cancel) {
                Ok(code) => code,
                Err(e) => {
                    error!(
                        "Load '{}' failed on window {}: {}",
                        config.load.name, window, e
                    );
                    return Err(e);
                }
            };

            match code {
                ExitCode::Success => {
                    LoadProgress::advance(
                        self.stores.control,
                        config.load.load_progress_id,
                        window.end,
                    )?;
                    report.windows_committed += 1;
                }
                ExitCode::OperationNotRequired => {
                    info!(
                        "Load '{}' stopping at window {}: nothing more to do",
                        config.load.name, window
                    );
                    return Ok(LoopEnd::Exhausted);
                }
                other => {
                    return Ok(LoopEnd::Stop(match cancel.reason() {
                        Some(CancelReason::Cooperative) => ExitCode::Success,
                        _ => {
                            if other != ExitCode::Abort {
                                warn!("Unexpected job result {} treated as abort", other);
                            }
                            ExitCode::Abort
                        }
                    }));
                }
            }
        }

        Ok(LoopEnd::Exhausted)
    }
}
