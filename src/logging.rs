//! Tracing initialisation.
//!
//! Level comes from the config (`--debug` forces debug) and can be
//! overridden per-module with `RUST_LOG`. When a log file is configured,
//! output goes to stdout and to a daily-rotated file with a bounded number
//! of retained rotations.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::GlobalConfig;

/// Keeps the background log writer alive. Hold it for the process lifetime.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init(global: &GlobalConfig, debug: bool) -> Result<LogGuard> {
    let level = if debug { "debug" } else { global.log_level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::stderr().is_terminal());

    if global.log_file.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .context("failed to initialise logging")?;
        return Ok(LogGuard { _file_guard: None });
    }

    let path = Path::new(&global.log_file);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("nam.log");

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(global.log_max_backups.max(1) as usize)
        .build(dir)
        .context("failed to open log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("failed to initialise logging")?;

    Ok(LogGuard {
        _file_guard: Some(guard),
    })
}
