//! # Logging Bootstrap
//!
//! One `tracing` subscriber for a whole process: human readable lines on
//! stdout and JSON lines in a daily rolling file. `RUST_LOG` overrides the
//! configured level.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use glob::glob;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. Keep the returned guard alive until the
/// process exits or buffered file lines are lost.
pub fn init_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let removed = cleanup_old_logs(log_dir, app_name)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log level {log_level:?}"))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{app_name}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(log_dir = %log_dir.display(), removed, "Logging initialized");
    Ok(guard)
}

/// Deletes every log file of `app_name` in `log_dir` except the most recently
/// modified one. Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> Result<usize> {
    let pattern = format!("{}/{}.log*", log_dir.display(), app_name);

    let mut files: Vec<(PathBuf, SystemTime)> = glob(&pattern)
        .context("bad log file pattern")?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let modified = path.metadata().and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .collect();

    // Newest first
    files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in files.iter().skip(1) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
