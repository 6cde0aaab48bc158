//! # Local Logger
//!
//! Installs the process-wide `tracing` subscriber with three sinks:
//!
//! - console: human-readable, or JSON when running in production,
//! - `combined.log`: every record that passes the level filter, as JSON,
//! - `error.log`: ERROR records only, as JSON.
//!
//! File writers are non-blocking; the returned [`LoggerGuards`] must be held
//! until exit so buffered records are flushed.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, ParseError};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Failed to create log directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to open log file")]
    Appender(#[from] InitError),
    #[error("Invalid log filter")]
    Filter(#[from] ParseError),
    #[error("A global logger is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// # Logger Local Options
#[derive(Debug, Clone)]
pub struct LoggerLocalOptions {
    /// Default filter directive (e.g. "info"); `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit console records as JSON instead of the pretty format.
    pub json_console: bool,
    /// Directory for the file sinks. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggerLocalOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_console: false,
            log_dir: Some(PathBuf::from("./logs")),
        }
    }
}

/// Keeps the background writer threads alive.
#[must_use = "dropping the guards stops the file writers"]
pub struct LoggerGuards {
    _guards: Vec<WorkerGuard>,
}

fn file_appender(dir: &PathBuf, name: &str) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .filename_suffix("log")
        .build(dir)
}

/// Builds the level filter, honouring `RUST_LOG` when it is set.
pub fn build_filter(level: &str) -> Result<EnvFilter, ParseError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level),
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn setup_logging(options: &LoggerLocalOptions) -> Result<LoggerGuards, LoggerError> {
    let filter = build_filter(&options.level)?;
    let mut guards = Vec::new();

    let (pretty_console, json_console) = if options.json_console {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };

    let (combined_layer, error_layer) = match &options.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|source| LoggerError::CreateDir {
                path: dir.clone(),
                source,
            })?;

            let (combined, combined_guard) = tracing_appender::non_blocking(file_appender(dir, "combined")?);
            let (errors, errors_guard) = tracing_appender::non_blocking(file_appender(dir, "error")?);
            guards.push(combined_guard);
            guards.push(errors_guard);

            (
                Some(fmt::layer().json().with_ansi(false).with_writer(combined)),
                Some(
                    fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(errors)
                        .with_filter(LevelFilter::ERROR),
                ),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty_console)
        .with(json_console)
        .with(combined_layer)
        .with(error_layer)
        .try_init()?;

    Ok(LoggerGuards { _guards: guards })
}

/// Renders an error and its `source()` chain on one line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
