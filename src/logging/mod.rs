//! Logging framework: env-filtered console output plus an optional
//! non-blocking file layer.

use crate::core::config::LoggingConfig;
use crate::Result;
use anyhow::{anyhow, Context};
use std::env;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "attacklens.log";
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Keeps the non-blocking writer alive for the process lifetime.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured
/// default level.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(anyhow!("logging already initialized"));
    }

    let level = env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.level.clone());
    let filter = EnvFilter::try_new(&level)
        .with_context(|| format!("failed to create log filter from '{}'", level))?;

    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let mut file_guard = None;
    let file_layer = if config.file_enabled {
        fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("failed to create log directory {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        Some(fmt::layer().with_ansi(false).with_writer(writer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber; check logging configuration")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
