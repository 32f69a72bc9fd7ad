//! Centralized file-based logging system
//!
//! Writes logs to files under the configured directory, separated by type:
//! - <dir>/main - all events, JSON
//! - <dir>/error - warnings and errors only
//! - <dir>/transport - `ws`, `socketio` and `pusher` targets
//!
//! Console output is always on. File output can be turned off in config.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::infrastructure::config::LoggingConfig;

/// Targets routed to the transport log
pub const TRANSPORT_TARGETS: [&str; 3] = ["ws", "socketio", "pusher"];

/// Initialize logging
///
/// `RUST_LOG` overrides the configured level. Returns the WorkerGuards,
/// which must be kept alive for the duration of the program.
pub fn init_logging(config: &LoggingConfig) -> io::Result<Vec<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut guards = Vec::new();
    let mut file_layers = None;

    if config.file {
        let (main_appender, main_guard) = create_appender(&config.dir, "main")?;
        guards.push(main_guard);
        let (error_appender, error_guard) = create_appender(&config.dir, "error")?;
        guards.push(error_guard);
        let (transport_appender, transport_guard) = create_appender(&config.dir, "transport")?;
        guards.push(transport_guard);

        // Main log - all logs
        let main_layer = tracing_subscriber::fmt::layer()
            .with_writer(main_appender)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .json();

        // Error log - ERROR and WARN only
        let error_layer = tracing_subscriber::fmt::layer()
            .with_writer(error_appender)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

        let transport_layer = tracing_subscriber::fmt::layer()
            .with_writer(transport_appender)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
                is_transport_target(metadata.target())
            }));

        file_layers = Some(main_layer.and_then(error_layer).and_then(transport_layer));
    }

    // Console layer
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layers)
        .with(console_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    tracing::info!(
        file = config.file,
        dir = %config.dir.display(),
        "Logging system initialized"
    );

    Ok(guards)
}

/// Whether `target` belongs in the transport log
#[inline]
pub fn is_transport_target(target: &str) -> bool {
    TRANSPORT_TARGETS
        .iter()
        .any(|t| target == *t || target.starts_with(&format!("{t}::")))
}

/// Create a daily rolling, non-blocking file appender under `dir/name`
fn create_appender(dir: &Path, name: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    let dir = dir.join(name);
    fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    Ok((non_blocking, guard))
}

/// Log macro helpers for specific log types
#[macro_export]
macro_rules! log_ws {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "ws", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_socketio {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "socketio", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_pusher {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "pusher", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_engine {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "engine", $level, $($arg)+)
    };
}
