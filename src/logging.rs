use std::fs;
use std::path::Path;
use once_cell::sync::OnceCell;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{StackjoinError, Result};

static INIT: OnceCell<()> = OnceCell::new();

const LOG_PREFIX: &str = "stackjoin";
const LOG_SUFFIX: &str = "log";

/// Install the global subscriber: console output on stderr plus an optional
/// daily-rotated JSON file. `RUST_LOG` overrides the configured level.
/// Calls after the first successful one are no-ops.
pub fn init(config: &LoggingConfig) -> Result<()> {
    INIT.get_or_try_init(|| install(config)).map(|_| ())
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn install(config: &LoggingConfig) -> Result<()> {
    // Forward `log` records from dependencies into tracing
    tracing_log::LogTracer::init()
        .map_err(|e| StackjoinError::config(format!("Failed to install log bridge: {}", e)))?;

    let console = config.console.then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter(&config.level))
    });

    let file = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            cleanup_old_logs(dir, config.max_files);

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix(LOG_SUFFIX)
                .build(dir)
                .map_err(|e| StackjoinError::config(format!("Failed to create file appender: {}", e)))?;

            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| StackjoinError::config(format!("Failed to set tracing subscriber: {}", e)))?;
    Ok(())
}

/// Keep only the newest `keep` rotated log files in `log_dir`
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let path = entry.path();
            let is_log = path.extension().map(|ext| ext == LOG_SUFFIX).unwrap_or(false);
            let ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX))
                .unwrap_or(false);
            is_log && ours
        })
        .collect();

    // Newest first
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        if fs::remove_file(old_file.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
