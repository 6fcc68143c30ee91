use std::env;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::errors::MenderError;

const LOG_FILE: &str = "mender.log";

// HTTP and WebSocket internals are noisy at debug
const QUIET_TARGETS: &[&str] = &[
    "hyper=warn",
    "reqwest=warn",
    "tungstenite=warn",
    "tokio_tungstenite=warn",
];

fn log_level() -> Level {
    env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO)
}

/// `MENDER_LOG_DIR`, else the platform data dir.
pub fn log_dir() -> PathBuf {
    match env::var("MENDER_LOG_DIR") {
        Ok(custom) if !custom.trim().is_empty() => PathBuf::from(custom),
        _ => dirs::data_local_dir()
            .unwrap_or_else(env::temp_dir)
            .join("mender")
            .join("logs"),
    }
}

fn filter(level: Level) -> EnvFilter {
    QUIET_TARGETS.iter().fold(
        EnvFilter::from_default_env().add_directive(level.into()),
        |filter, directive| match directive.parse() {
            Ok(d) => filter.add_directive(d),
            Err(_) => filter,
        },
    )
}

/// Installs stderr and daily-rolling file logging. Keep the returned guard
/// alive for the life of the process so buffered lines get flushed.
pub fn init_logging() -> Result<WorkerGuard, MenderError> {
    let level = log_level();
    let dir = log_dir();
    std::fs::create_dir_all(&dir).map_err(|e| {
        MenderError::Config(format!("Cannot create log directory {}: {e}", dir.display()))
    })?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter(level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter(level)),
        )
        .try_init()
        .map_err(|e| MenderError::Config(format!("Logging already initialized: {e}")))?;

    tracing::debug!(dir = %dir.display(), "Logging initialized");
    Ok(guard)
}
