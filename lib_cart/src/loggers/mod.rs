//! # Logging Bootstrap
//!
//! Installs the global `tracing` subscriber used by the console binary and
//! by applications embedding the engine:
//!
//! - an `EnvFilter` read from `RUST_LOG`, falling back to the configured level;
//! - a human-readable console layer with targets and ANSI colors;
//! - optionally, a JSON layer on a daily rolling file written through a
//!   non-blocking worker.
//!
//! Old rolled files are pruned at startup so the directory keeps only the
//! newest `keep_files`.

#![forbid(unsafe_code)]

use crate::configs::LogOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("log directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a global subscriber is already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid log file pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Keeps the file writer alive. Dropping it flushes and stops file logging.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// # Setup Logging
///
/// Installs the global subscriber described by `options`. Fails if one is
/// already installed.
pub fn setup_logging(options: &LogOptions) -> Result<LoggingGuard, LoggerError> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&options.level))?;

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            prune_logs(dir, &options.file_prefix, options.keep_files)?;
            let file_appender = rolling::daily(dir, &options.file_prefix);
            let (writer, guard) = non_blocking(file_appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(level = %options.level, log_dir = ?options.log_dir, "logging initialized");
    Ok(LoggingGuard {
        _file: guard,
        log_dir: options.log_dir.clone(),
    })
}

/// Deletes all but the newest `keep` files named `{prefix}.*` in `dir`.
/// Rolled file names end in the date, so name order is age order.
/// Returns the number of files removed.
pub fn prune_logs(dir: &Path, prefix: &str, keep: usize) -> Result<usize, LoggerError> {
    let pattern = dir.join(format!("{}.*", glob::Pattern::escape(prefix)));
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let excess = files.len().saturating_sub(keep);
    let mut removed = 0;
    for path in files.into_iter().take(excess) {
        std::fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}
