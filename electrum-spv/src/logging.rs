//! Tracing setup: an env-filtered console layer and an optional per-run log file.
//!
//! Each run writes to `run.log`. On startup the previous `run.log` is archived as
//! `electrum-spv.<timestamp>.log` and only the newest archives are kept.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

const ARCHIVE_PREFIX: &str = "electrum-spv.";
const ACTIVE_LOG: &str = "run.log";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Keeps the file writer alive; buffered lines are flushed when dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Falls back to `RUST_LOG`, then INFO, when unset.
    pub level: Option<LevelFilter>,
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Archived runs to keep next to the active log.
    pub max_archives: usize,
}

pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: None,
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _file_writer: None,
        });
    }

    let filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, file_writer) = match &config.file {
        Some(file_config) => {
            let (writer, guard) = open_run_log(file_config)?;
            let layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let console_layer = config.console.then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _file_writer: file_writer,
    })
}

fn open_run_log(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_active_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_archives)?;
    let file = File::create(config.log_dir.join(ACTIVE_LOG))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Rename `run.log` after its last modification time.
fn archive_active_log(log_dir: &Path) -> LoggingResult<()> {
    let active = log_dir.join(ACTIVE_LOG);
    let Ok(metadata) = fs::metadata(&active) else {
        return Ok(());
    };
    let modified: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
    let stamp = modified.format(TIMESTAMP_FORMAT).to_string();

    let target = std::iter::once(format!("{}{}.log", ARCHIVE_PREFIX, stamp))
        .chain((1..1000).map(|n| format!("{}{}-{}.log", ARCHIVE_PREFIX, stamp, n)))
        .map(|name| log_dir.join(name))
        .find(|path| !path.exists())
        .ok_or_else(|| LoggingError::RotationFailed(format!("no free archive name for {}", stamp)))?;

    fs::rename(&active, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))
}

fn is_archive(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".log")
}

/// Delete the oldest archives beyond `keep`. Archive names sort chronologically.
fn prune_archives(log_dir: &Path, keep: usize) -> LoggingResult<()> {
    let mut archives: Vec<String> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("cannot list {}: {}", log_dir.display(), e)))?
        .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
        .filter(|name| is_archive(name))
        .collect();
    if archives.len() <= keep {
        return Ok(());
    }
    archives.sort();
    let excess = archives.len() - keep;
    for name in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(log_dir.join(&name)) {
            tracing::warn!("failed to remove old log {}: {}", name, e);
        }
    }
    Ok(())
}
