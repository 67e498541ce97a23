mod audit;
mod cancellation;
mod cli;
mod config;
mod database;
mod date_strategy;
mod definition;
mod eligibility;
mod error;
mod exit_code;
mod fetch_request;
mod fetcher;
mod load_job;
mod locks;
mod migration;
mod permission_window;
mod progress;
mod runner;
mod schema;
mod utils;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use exit_code::ExitCode;
use flexi_logger::Logger;
use log::{debug, error};

fn main() {
    let project_dirs = match ProjectDirs::from("", "", "stageload") {
        Some(dirs) => dirs,
        None => {
            eprintln!("Could not determine the project directories");
            std::process::exit(ExitCode::Error.process_status());
        }
    };

    let config = Config::load_config(&project_dirs);

    // RUST_LOG takes precedence over the configured level
    let log_spec = format!("stageload={}", config.logging.stageload);
    let _logger = match Logger::try_with_env_or_str(&log_spec).and_then(|logger| logger.start()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    if CONFIG.set(config).is_err() {
        eprintln!("Configuration was already initialized");
    }

    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    let code = match Cli::handle_command_line() {
        Ok(code) => code,
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{}", err);
            let root = err.root_cause();
            if !std::ptr::eq(root, &err) {
                eprintln!("Caused by: {}", root);
            }
            ExitCode::Error
        }
    };

    std::process::exit(code.process_status());
}
