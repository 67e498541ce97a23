use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub stageload: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&'static str; 5] = ["error", "warn", "info", "debug", "trace"];
    const STAGELOAD_LEVEL: &'static str = "info";

    fn default() -> Self {
        LoggingConfig {
            stageload: Self::STAGELOAD_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let original = self.stageload.clone();
        self.stageload = self.stageload.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.stageload.as_str()) {
            eprintln!(
                "Config error: stageload log level of '{}' is invalid - using default of '{}'",
                original,
                Self::STAGELOAD_LEVEL
            );
            self.stageload = Self::STAGELOAD_LEVEL.to_owned();
        }
    }
}

/// Locations of the four stores
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub control: PathBuf,
    pub cache: PathBuf,
    pub staging: PathBuf,
    pub live: PathBuf,
}

impl DatabaseConfig {
    fn default_in(dir: &Path) -> Self {
        DatabaseConfig {
            control: dir.join("control.db"),
            cache: dir.join("cache.db"),
            staging: dir.join("staging.db"),
            live: dir.join("live.db"),
        }
    }

    fn ensure_valid(&mut self, dir: &Path) {
        let defaults = Self::default_in(dir);
        for (name, path, default) in [
            ("control", &mut self.control, defaults.control),
            ("cache", &mut self.cache, defaults.cache),
            ("staging", &mut self.staging, defaults.staging),
            ("live", &mut self.live, defaults.live),
        ] {
            if path.as_os_str().is_empty() {
                eprintln!(
                    "Config error: database.{} is empty - using default of '{}'",
                    name,
                    default.display()
                );
                *path = default;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Recorded against every lock this process takes
    pub holder_name: String,
    /// 0 drives every due load in one invocation
    pub max_records_per_run: usize,
}

impl SchedulerConfig {
    const HOLDER_NAME: &'static str = "stageload";

    fn default() -> Self {
        SchedulerConfig {
            holder_name: Self::HOLDER_NAME.to_string(),
            max_records_per_run: 0,
        }
    }

    fn ensure_valid(&mut self) {
        if self.holder_name.trim().is_empty() {
            eprintln!(
                "Config error: scheduler.holder_name is empty - using default of '{}'",
                Self::HOLDER_NAME
            );
            self.holder_name = Self::HOLDER_NAME.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    fn default_in(dir: &Path) -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default_in(dir),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Loads the configuration from `config.toml` in the app's local data
    /// directory, then applies `STAGELOAD_` environment overrides
    /// (e.g. `STAGELOAD_SCHEDULER__HOLDER_NAME`).
    /// Writes the default config to disk if no file exists. A file that fails
    /// to parse is reported and the defaults are used.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let data_dir = project_dirs.data_local_dir();
        let config_path = data_dir.join("config.toml");
        let default_config = Config::default_in(data_dir);

        if !config_path.exists() {
            if let Err(e) = fs::create_dir_all(data_dir) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    data_dir.display(),
                    e
                );
            }
            match toml::to_string_pretty(&default_config) {
                Ok(toml_string) => {
                    if let Err(e) = fs::write(&config_path, toml_string) {
                        eprintln!(
                            "Failed to write default config to {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
                Err(e) => eprintln!("Failed to serialize default config: {}", e),
            }
        }

        Self::from_figment(Self::figment(&config_path, &default_config), default_config, data_dir)
    }

    fn figment(config_path: &Path, defaults: &Config) -> Figment {
        Figment::from(Serialized::defaults(defaults.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("STAGELOAD_").split("__"))
    }

    fn from_figment(figment: Figment, default_config: Config, data_dir: &Path) -> Self {
        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!("Could not load configuration: {}. Using default configuration.", err);
            default_config
        });
        config.ensure_valid(data_dir);
        config
    }

    fn ensure_valid(&mut self, data_dir: &Path) {
        self.logging.ensure_valid();
        self.database.ensure_valid(data_dir);
        self.scheduler.ensure_valid();
    }
}
