use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::thread;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use rusqlite::Connection;

use crate::audit::SqliteAuditLog;
use crate::cancellation::CancellationSignal;
use crate::config::{Config, CONFIG};
use crate::database::Database;
use crate::definition::LoadDefinition;
use crate::eligibility::RunEligibilityFinder;
use crate::error::LoadError;
use crate::exit_code::ExitCode;
use crate::fetch_request::FetchRequestBuilder;
use crate::fetcher::{CacheDatabaseFetcher, FetchFailure};
use crate::load_job::LoadStores;
use crate::locks::LockManager;
use crate::progress::{CacheProgress, LoadConfiguration};
use crate::runner::ChunkedScheduleRunner;
use crate::utils::Utils;

#[derive(Parser)]
#[command(
    name = "stageload",
    version,
    about = "stageload: cache-driven incremental loads from staging into a live store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one scheduler pass over every due load
    Run {
        /// Stop cooperatively after this long (e.g. "30m"); committed windows stand
        #[arg(long = "stop-after")]
        stop_after: Option<String>,

        /// Abort after this long (e.g. "2h")
        #[arg(long = "abort-after")]
        abort_after: Option<String>,
    },

    /// Show every load with its progress, lock state and eligibility
    Status,

    /// Register a load from a TOML definition file
    Define {
        #[arg(long = "file", short = 'f')]
        file: PathBuf,
    },

    /// Record that the cache holds confirmed data up to a date
    CacheFill {
        /// Load progress id
        #[arg(long = "id")]
        id: i64,

        /// YYYY-MM-DD or "YYYY-MM-DD HH:MM:SS" (UTC)
        #[arg(long = "until")]
        until: String,
    },

    /// Show the next fetch request of a load
    NextFetch {
        #[arg(long = "id")]
        id: i64,
    },

    /// Release the locks of a load left behind by a killed process
    Unlock {
        #[arg(long = "id")]
        id: i64,
    },

    /// Show recent runs and fetch failures of a load
    History {
        #[arg(long = "id")]
        id: i64,

        /// Number of runs to show
        #[arg(long = "count", short = 'n', default_value_t = 10)]
        count: i64,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<ExitCode, LoadError> {
        let args = Cli::parse();
        let config = CONFIG
            .get()
            .ok_or_else(|| LoadError::Error("Configuration was not loaded".to_string()))?;

        let control = Database::open_control(&config.database.control)?;

        match args.command {
            Command::Run {
                stop_after,
                abort_after,
            } => {
                let cancel = CancellationSignal::new();
                if let Some(limit) = stop_after {
                    let limit = Utils::parse_duration(&limit)?;
                    Self::signal_after(&cancel, limit, false)?;
                }
                if let Some(limit) = abort_after {
                    let limit = Utils::parse_duration(&limit)?;
                    Self::signal_after(&cancel, limit, true)?;
                }
                Self::run(config, &control, &cancel)
            }
            Command::Status => {
                print!("{}", Self::render_status(&control, Utc::now())?);
                Ok(ExitCode::Success)
            }
            Command::Define { file } => {
                let text = fs::read_to_string(&file)?;
                let load = LoadDefinition::from_toml(&text)?.apply(&control)?;
                println!(
                    "Defined load '{}' with id {}",
                    load.load.name, load.load.load_progress_id
                );
                Ok(ExitCode::Success)
            }
            Command::CacheFill { id, until } => {
                let until = Utils::parse_date(&until)?;
                CacheProgress::record_fill(&control, id, until)?;
                println!(
                    "Cache of load {} filled to {}",
                    id,
                    Utils::format_date(&until)
                );
                Ok(ExitCode::Success)
            }
            Command::NextFetch { id } => {
                print!("{}", Self::render_next_fetch(&control, id, Utc::now())?);
                Ok(ExitCode::Success)
            }
            Command::Unlock { id } => {
                let load = Self::load_configuration(&control, id)?;
                LockManager::force_unlock(&control, &load)?;
                println!("Unlocked load {}", id);
                Ok(ExitCode::Success)
            }
            Command::History { id, count } => {
                print!("{}", Self::render_history(&control, id, count)?);
                Ok(ExitCode::Success)
            }
        }
    }

    /// Pull `cancel` once `limit` has elapsed
    fn signal_after(
        cancel: &CancellationSignal,
        limit: Duration,
        hard: bool,
    ) -> Result<(), LoadError> {
        let wait = limit
            .to_std()
            .map_err(|_| LoadError::Configuration("Time limit must not be negative".to_string()))?;
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(wait);
            if hard {
                warn!("Abort time limit reached");
                cancel.request_abort();
            } else {
                info!("Stop time limit reached; finishing the current window");
                cancel.request_stop();
            }
        });
        Ok(())
    }

    fn run(
        config: &Config,
        control: &Connection,
        cancel: &CancellationSignal,
    ) -> Result<ExitCode, LoadError> {
        let cache = Database::open_store(&config.database.cache)?;
        let staging = Database::open_store(&config.database.staging)?;
        let live = Database::open_store(&config.database.live)?;
        let stores = LoadStores {
            control,
            staging: &staging,
            live: &live,
        };

        let mut fetcher = CacheDatabaseFetcher::new(&cache);
        let report = ChunkedScheduleRunner::new(stores, &mut fetcher, &config.scheduler.holder_name)
            .with_max_records(config.scheduler.max_records_per_run)
            .run(cancel)?;

        info!(
            "Scheduler run: {} ({} windows committed for loads {:?})",
            report.exit_code, report.windows_committed, report.load_progress_ids
        );
        println!(
            "{} ({} windows committed)",
            report.exit_code, report.windows_committed
        );
        Ok(report.exit_code)
    }

    fn load_configuration(conn: &Connection, id: i64) -> Result<LoadConfiguration, LoadError> {
        LoadConfiguration::get(conn, id)?
            .ok_or_else(|| LoadError::Error(format!("Load {} not found", id)))
    }

    pub fn render_status(conn: &Connection, now: DateTime<Utc>) -> Result<String, LoadError> {
        let configs = LoadConfiguration::list(conn)?;
        let locked = LockManager::locked_entities(conn)?;

        let mut out = String::new();
        if configs.is_empty() {
            out.push_str("No loads defined\n");
            return Ok(out);
        }

        let _ = writeln!(
            out,
            "{:<4} {:<20} {:<20} {:<20} {:>5} {:<7} {}",
            "ID", "NAME", "LOADED TO", "CACHED TO", "DAYS", "LOCKED", "STATUS"
        );
        for config in &configs {
            let cached_to = config
                .cache
                .as_ref()
                .and_then(|c| c.cache_fill_progress);
            let status = match RunEligibilityFinder::check(config, &locked) {
                Ok(()) => {
                    let permitted = config
                        .cache
                        .as_ref()
                        .and_then(|c| c.permission_window.as_ref())
                        .map_or(true, |w| w.is_permitted(now));
                    if permitted {
                        "due".to_string()
                    } else {
                        "due (outside permission window)".to_string()
                    }
                }
                Err(reason) => reason.describe().to_string(),
            };
            let _ = writeln!(
                out,
                "{:<4} {:<20} {:<20} {:<20} {:>5} {:<7} {}",
                config.load.load_progress_id,
                config.load.name,
                Utils::format_opt_date(&config.load.data_load_progress),
                Utils::format_opt_date(&cached_to),
                config.load.default_days,
                if config.load.is_locked { "yes" } else { "no" },
                status
            );
        }
        match RunEligibilityFinder::find_eligible(&configs, &locked) {
            Some(next) => {
                let _ = writeln!(out, "\nNext due: {}", next.load.name);
            }
            None => out.push_str("\nNo load is due\n"),
        }
        Ok(out)
    }

    pub fn render_history(conn: &Connection, id: i64, count: i64) -> Result<String, LoadError> {
        let config = Self::load_configuration(conn, id)?;
        let audit = SqliteAuditLog::new(conn);

        let mut out = String::new();
        let _ = writeln!(out, "Runs of '{}':", config.load.name);
        let runs = audit.runs_for(id, count)?;
        if runs.is_empty() {
            out.push_str("  (none)\n");
        }
        for run in &runs {
            let _ = writeln!(
                out,
                "  #{:<5} {} {:<9} +{} ~{} {}",
                run.run_id,
                run.window,
                run.status.full_name(),
                run.inserts.unwrap_or(0),
                run.updates.unwrap_or(0),
                run.message.as_deref().unwrap_or("")
            );
            for table in audit.tables_for(run.run_id)? {
                let _ = writeln!(
                    out,
                    "         {:<20} +{} ~{}",
                    table.table_name, table.inserts, table.updates
                );
            }
        }

        let failures = FetchFailure::list_for(conn, id)?;
        if !failures.is_empty() {
            let _ = writeln!(out, "Fetch failures:");
            for failure in &failures {
                let _ = writeln!(
                    out,
                    "  [{} .. {}) {}",
                    Utils::format_date(&failure.start),
                    Utils::format_date(&failure.end),
                    failure.message
                );
            }
        }
        Ok(out)
    }

    pub fn render_next_fetch(
        conn: &Connection,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<String, LoadError> {
        let config = Self::load_configuration(conn, id)?;
        let cache = config.cache.as_ref().ok_or_else(|| {
            LoadError::Configuration(format!("Load {} has no cache progress", id))
        })?;
        let request = FetchRequestBuilder::create(cache, &config.load)?;

        let mut out = String::new();
        let _ = writeln!(out, "Load:       {} ({})", config.load.name, id);
        let _ = writeln!(out, "Strategy:   {}", config.load.date_strategy.full_name());
        let _ = writeln!(out, "Start:      {}", Utils::format_date(&request.start));
        let _ = writeln!(out, "End:        {}", Utils::format_date(&request.end()));
        let _ = writeln!(
            out,
            "Following:  {}",
            Utils::format_date(&request.next().start)
        );
        let _ = writeln!(
            out,
            "Chunk:      {}",
            Utils::format_duration(&request.chunk_period)
        );
        let _ = writeln!(
            out,
            "Window:     {}",
            if request.permission_window.is_unrestricted() {
                "unrestricted"
            } else {
                request.permission_window.name.as_str()
            }
        );
        let _ = writeln!(
            out,
            "Ready:      {}",
            if request.is_ready(now, cache.lag_period) { "yes" } else { "no (inside lag period)" }
        );
        let _ = writeln!(
            out,
            "Permitted:  {}",
            if request.is_permitted(now) { "yes" } else { "no" }
        );
        Ok(out)
    }
}
