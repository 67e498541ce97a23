use log::{error, info};
use rusqlite::Connection;

use crate::audit::AuditLog;
use crate::cancellation::CancellationSignal;
use crate::date_strategy::LoadWindow;
use crate::error::LoadError;
use crate::exit_code::ExitCode;
use crate::fetch_request::CacheFetchRequest;
use crate::fetcher::Fetcher;
use crate::migration::{MigrationStatus, MigrationTransaction};
use crate::permission_window::PermissionWindow;
use crate::progress::LoadConfiguration;

/// The three stores a load touches. The control store holds progress,
/// locks and the audit log.
#[derive(Clone, Copy)]
pub struct LoadStores<'a> {
    pub control: &'a Connection,
    pub staging: &'a Connection,
    pub live: &'a Connection,
}

/// One fetch + migrate unit for a single sub-window.
///
/// Progress is not advanced here; the caller does that once the job
/// reports `Success`.
pub struct LoadJob<'a> {
    config: &'a LoadConfiguration,
    window: LoadWindow,
}

impl<'a> LoadJob<'a> {
    pub fn new(config: &'a LoadConfiguration, window: LoadWindow) -> Self {
        Self { config, window }
    }

    /// The fetch request covering exactly this job's window
    pub fn fetch_request(&self) -> CacheFetchRequest {
        CacheFetchRequest {
            start: self.window.start,
            chunk_period: self.window.length(),
            permission_window: self
                .config
                .cache
                .as_ref()
                .and_then(|c| c.permission_window.clone())
                .unwrap_or_else(PermissionWindow::unrestricted),
        }
    }

    /// Run the job.
    ///
    /// - `Success`: the window was committed to the live store
    /// - `OperationNotRequired`: the fetch failed; the failure is recorded
    ///   and the window will be retried on a later invocation
    /// - `Abort`: the migration saw cancellation and rolled back
    ///
    /// Structural failures are returned as errors after the audit run is
    /// marked failed.
    pub fn execute(
        &self,
        stores: LoadStores,
        fetcher: &mut dyn Fetcher,
        audit: &dyn AuditLog,
        cancel: &CancellationSignal,
    ) -> Result<ExitCode, LoadError> {
        let load_id = self.config.load.load_progress_id;
        let run_id = audit.record_run_started(load_id, &self.window)?;

        match self.fetch_and_migrate(stores, fetcher, audit, cancel, run_id) {
            Ok(code) => Ok(code),
            Err(e) => {
                if let Err(audit_err) = audit.record_run_failed(run_id, &e.to_string()) {
                    error!("Failed to record failure of run {}: {}", run_id, audit_err);
                }
                Err(e)
            }
        }
    }

    fn fetch_and_migrate(
        &self,
        stores: LoadStores,
        fetcher: &mut dyn Fetcher,
        audit: &dyn AuditLog,
        cancel: &CancellationSignal,
        run_id: i64,
    ) -> Result<ExitCode, LoadError> {
        let load = &self.config.load;
        let columns = &self.config.columns;

        // Leftovers from an interrupted unit must not leak into this window
        MigrationTransaction::clear_staging(stores.staging, columns)?;

        let request = self.fetch_request();
        if let Err(failure) = fetcher.fetch(&request, columns, stores.staging) {
            failure.record(stores.control, load.load_progress_id)?;
            audit.record_run_failed(run_id, &failure.to_string())?;
            MigrationTransaction::clear_staging(stores.staging, columns)?;
            return Ok(ExitCode::OperationNotRequired);
        }

        let outcome = MigrationTransaction::migrate(
            stores.staging,
            stores.live,
            columns,
            cancel,
            &mut |table, totals| {
                info!(
                    "Load '{}' {}: table '{}' {} inserted, {} updated (running total {}/{})",
                    load.name,
                    self.window,
                    table.table_name,
                    table.inserts,
                    table.updates,
                    totals.inserts,
                    totals.updates
                )
            },
        )?;

        match outcome.status {
            MigrationStatus::Committed => {
                audit.record_run_completed(run_id, &outcome.tables)?;
                Ok(ExitCode::Success)
            }
            MigrationStatus::Cancelled => {
                audit.record_run_failed(run_id, "Cancelled before commit")?;
                Ok(ExitCode::Abort)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{RunStatus, SqliteAuditLog};
    use crate::fetcher::{CacheDatabaseFetcher, FetchFailure};
    use crate::migration::ColumnSet;
    use crate::progress::test_support::{control_with_load, date};
    use pretty_assertions::assert_eq;

    struct FailingFetcher;

    impl Fetcher for FailingFetcher {
        fn fetch(
            &mut self,
            request: &CacheFetchRequest,
            _columns: &ColumnSet,
            _staging: &Connection,
        ) -> Result<u64, FetchFailure> {
            Err(FetchFailure::new(request, "source offline"))
        }
    }

    fn events_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, event_date INTEGER, value TEXT)",
        )
        .unwrap();
        conn
    }

    fn window() -> LoadWindow {
        LoadWindow {
            start: date("2001-01-01"),
            end: date("2001-01-02"),
        }
    }

    fn live_count(live: &Connection) -> i64 {
        live.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_successful_job_commits_and_closes_run() {
        let (control, id) = control_with_load(Some("2001-01-01"), Some("2001-01-02"), 1);
        let config = LoadConfiguration::get(&control, id).unwrap().unwrap();
        let cache = events_store();
        cache
            .execute(
                "INSERT INTO events VALUES (1, ?, 'a')",
                [date("2001-01-01 06:00:00").timestamp()],
            )
            .unwrap();
        let staging = Connection::open_in_memory().unwrap();
        let live = events_store();
        let stores = LoadStores {
            control: &control,
            staging: &staging,
            live: &live,
        };

        let audit = SqliteAuditLog::new(&control);
        let code = LoadJob::new(&config, window())
            .execute(
                stores,
                &mut CacheDatabaseFetcher::new(&cache),
                &audit,
                &CancellationSignal::new(),
            )
            .unwrap();

        assert_eq!(code, ExitCode::Success);
        assert_eq!(live_count(&live), 1);
        let runs = audit.runs_for(id, 10).unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].inserts, Some(1));
    }

    #[test]
    fn test_fetch_failure_is_absorbed() {
        let (control, id) = control_with_load(Some("2001-01-01"), Some("2001-01-02"), 1);
        let config = LoadConfiguration::get(&control, id).unwrap().unwrap();
        let staging = Connection::open_in_memory().unwrap();
        let live = events_store();
        let stores = LoadStores {
            control: &control,
            staging: &staging,
            live: &live,
        };

        let audit = SqliteAuditLog::new(&control);
        let code = LoadJob::new(&config, window())
            .execute(stores, &mut FailingFetcher, &audit, &CancellationSignal::new())
            .unwrap();

        assert_eq!(code, ExitCode::OperationNotRequired);
        assert_eq!(FetchFailure::list_for(&control, id).unwrap().len(), 1);
        assert_eq!(audit.runs_for(id, 10).unwrap()[0].status, RunStatus::Failed);
    }

    #[test]
    fn test_empty_window_is_error_and_run_failed() {
        let (control, id) = control_with_load(Some("2001-01-01"), Some("2001-01-02"), 1);
        let config = LoadConfiguration::get(&control, id).unwrap().unwrap();
        let cache = events_store();
        let staging = Connection::open_in_memory().unwrap();
        let live = events_store();
        let stores = LoadStores {
            control: &control,
            staging: &staging,
            live: &live,
        };

        let audit = SqliteAuditLog::new(&control);
        let result = LoadJob::new(&config, window()).execute(
            stores,
            &mut CacheDatabaseFetcher::new(&cache),
            &audit,
            &CancellationSignal::new(),
        );

        assert!(matches!(result, Err(LoadError::SourceEmpty { .. })));
        let runs = audit.runs_for(id, 10).unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].message.as_deref().unwrap_or("").contains("events"));
    }

    #[test]
    fn test_fetch_request_covers_window() {
        let (control, id) = control_with_load(Some("2001-01-01"), Some("2001-01-02"), 1);
        let config = LoadConfiguration::get(&control, id).unwrap().unwrap();
        let window = LoadWindow {
            start: date("2001-01-03"),
            end: date("2001-01-06"),
        };
        let request = LoadJob::new(&config, window).fetch_request();
        assert_eq!(request.start, window.start);
        assert_eq!(request.end(), window.end);
        assert!(request.permission_window.is_unrestricted());
    }
}
