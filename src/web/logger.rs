// Logging setup: log4rs with a console appender and a timestamped file per run.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use thiserror::Error;

pub const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log level {0:?}")]
    Level(String),
    #[error("cannot create log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid logging configuration: {0}")]
    Config(String),
    #[error("logger already installed: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

pub fn parse_level(raw: &str) -> Result<LevelFilter, LoggingError> {
    LevelFilter::from_str(raw.trim()).map_err(|_| LoggingError::Level(raw.to_string()))
}

/// `<dir>/caption-server-YYYY-MM-DD-HH_MM.log`
pub fn log_file_path(log_dir: &Path, now: DateTime<Local>) -> PathBuf {
    log_dir.join(format!("caption-server-{}.log", now.format("%Y-%m-%d-%H_%M")))
}

/// Build the log4rs config; creates the log directory and file.
pub fn build_config(log_file: &Path, level: LevelFilter) -> Result<Config, LoggingError> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_file)?;
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("console").appender("file").build(level))
        .map_err(|e| LoggingError::Config(e.to_string()))
}

/// Install the global logger. Returns the path of this run's log file.
pub fn init(log_dir: &Path, level: &str) -> Result<PathBuf, LoggingError> {
    let level = parse_level(level)?;
    let log_file = log_file_path(log_dir, Local::now());
    let config = build_config(&log_file, level)?;
    log4rs::init_config(config)?;
    Ok(log_file)
}
