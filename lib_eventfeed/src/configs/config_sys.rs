//! # Process Configuration
//!
//! Settings are layered in the following order, later layers winning for
//! every value they actually set:
//!
//! 1. Built-in defaults.
//! 2. An optional JSON file (`--config-path`, default `eventfeed.conf`).
//! 3. Environment variables (a `.env` file is loaded first when present).
//! 4. Command-line flags.
//!
//! `clap` handles 3 and 4 in a single parse, so the raw layer type carries
//! only `Option`s and the resolved [`Settings`] carries concrete values.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "eventfeed.conf";

/// Errors that make start-up impossible.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid command line or environment")]
    Cli(#[from] clap::Error),

    #[error("Failed to read config file {}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}", path.display())]
    FileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Deployment environment. Production switches console logs to JSON.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    #[default]
    Development,
    Test,
    Production,
}

/// Log verbosity accepted on the configuration surface.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// One configuration layer. Every field is optional so layers can be merged.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[command(about = "Event snapshot distribution pipeline", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "EVENTFEED_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "APP_ENV", value_enum, help = "Deployment environment.")]
    pub app_env: Option<AppEnv>,

    #[arg(long, env = "PORT", help = "Port the WebSocket server listens on.")]
    pub port: Option<u16>,

    #[arg(long, env = "REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[arg(long, env = "POSTGRES_URL", help = "PostgreSQL connection URL.")]
    pub postgres_url: Option<String>,

    #[arg(long, env = "UPDATE_INTERVAL", help = "Snapshot refresh interval in milliseconds.")]
    pub update_interval_ms: Option<u64>,

    #[arg(long, env = "HEARTBEAT_INTERVAL", help = "Client liveness sweep interval in milliseconds.")]
    pub heartbeat_interval_ms: Option<u64>,

    #[arg(long, env = "SUBSCRIBE_RETRY_MS", help = "Delay before retrying a failed Redis subscription.")]
    pub subscribe_retry_ms: Option<u64>,

    #[arg(long, env = "LOG_LEVEL", value_enum, help = "Logging level.")]
    pub log_level: Option<LogLevel>,

    #[arg(long, env = "LOG_DIR", help = "Directory for combined.log and error.log.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "PG_POOL_SIZE", help = "Maximum PostgreSQL pool size.")]
    pub pg_pool_size: Option<usize>,
}

impl Config {
    /// Built-in defaults, the lowest layer.
    pub fn defaults() -> Self {
        Config {
            config_path: None,
            app_env: Some(AppEnv::Development),
            port: Some(3000),
            redis_url: Some("redis://localhost:6379".to_string()),
            postgres_url: None,
            update_interval_ms: Some(15_000),
            heartbeat_interval_ms: Some(30_000),
            subscribe_retry_ms: Some(5_000),
            log_level: Some(LogLevel::Info),
            log_dir: Some(PathBuf::from("./logs")),
            pg_pool_size: Some(4),
        }
    }

    // `other` overrides `self` for Some values
    pub fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            app_env: other.app_env.or(self.app_env),
            port: other.port.or(self.port),
            redis_url: other.redis_url.or(self.redis_url),
            postgres_url: other.postgres_url.or(self.postgres_url),
            update_interval_ms: other.update_interval_ms.or(self.update_interval_ms),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            subscribe_retry_ms: other.subscribe_retry_ms.or(self.subscribe_retry_ms),
            log_level: other.log_level.or(self.log_level),
            log_dir: other.log_dir.or(self.log_dir),
            pg_pool_size: other.pg_pool_size.or(self.pg_pool_size),
        }
    }

    /// Reads a JSON layer from disk.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::FileParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Collapses a fully merged layer into concrete settings.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let settings = Settings {
            app_env: self.app_env.unwrap_or_default(),
            port: self.port.ok_or(ConfigError::Missing("port"))?,
            redis_url: self.redis_url.ok_or(ConfigError::Missing("redis_url"))?,
            postgres_url: self.postgres_url.filter(|url| !url.trim().is_empty()),
            update_interval: positive_millis("update_interval_ms", self.update_interval_ms)?,
            heartbeat_interval: positive_millis("heartbeat_interval_ms", self.heartbeat_interval_ms)?,
            subscribe_retry: positive_millis("subscribe_retry_ms", self.subscribe_retry_ms)?,
            log_level: self.log_level.unwrap_or_default(),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            pg_pool_size: match self.pg_pool_size {
                Some(0) => {
                    return Err(ConfigError::Invalid {
                        name: "pg_pool_size",
                        reason: "must be at least 1".to_string(),
                    })
                }
                Some(size) => size,
                None => 4,
            },
        };
        Ok(settings)
    }
}

fn positive_millis(name: &'static str, value: Option<u64>) -> Result<Duration, ConfigError> {
    match value {
        None => Err(ConfigError::Missing(name)),
        Some(0) => Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        }),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Resolved process settings, constant for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app_env: AppEnv,
    pub port: u16,
    pub redis_url: String,
    pub postgres_url: Option<String>,
    pub update_interval: Duration,
    pub heartbeat_interval: Duration,
    pub subscribe_retry: Duration,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    pub pg_pool_size: usize,
}

impl Settings {
    /// The updater cannot run without a source-of-truth connection string.
    pub fn require_postgres_url(&self) -> Result<&str, ConfigError> {
        self.postgres_url
            .as_deref()
            .ok_or(ConfigError::Missing("postgres_url"))
    }

    /// Console and file sink options for this environment.
    #[cfg(feature = "loggers")]
    pub fn logger_options(&self) -> crate::loggers::loggerlocal::LoggerLocalOptions {
        crate::loggers::loggerlocal::LoggerLocalOptions {
            level: self.log_level.as_filter().to_string(),
            json_console: self.app_env == AppEnv::Production,
            log_dir: Some(self.log_dir.clone()),
        }
    }
}

/// Loads settings from the real process environment and arguments.
pub fn load_settings() -> Result<Settings, ConfigError> {
    // A missing .env is the normal case outside development.
    let _ = dotenvy::dotenv();
    match load_settings_from(std::env::args_os()) {
        // Help, version and usage errors are printed by clap itself.
        Err(ConfigError::Cli(e)) => e.exit(),
        other => other,
    }
}

/// Loads settings from an explicit argument list. Environment variables are
/// still consulted for anything the arguments leave unset.
pub fn load_settings_from<I, T>(args: I) -> Result<Settings, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Config::try_parse_from(args)?;

    let (file_path, explicit) = match &cli.config_path {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let mut layered = Config::defaults();
    if file_path.exists() {
        layered = layered.merge(Config::from_file(&file_path)?);
    } else if explicit {
        return Err(ConfigError::FileRead {
            path: file_path,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        });
    } else {
        tracing::debug!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            file_path.display()
        );
    }

    layered.merge(cli).resolve()
}
