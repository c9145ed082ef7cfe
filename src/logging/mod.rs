//! Logging setup for the connector and its binary
//!
//! Library code logs through the `log` facade; `LogTracer` forwards those
//! records into the `tracing` subscriber installed here.

use crate::models::ExchangeLog;
use anyhow::Result;
use log::LevelFilter;
use std::sync::Once;
use tracing::Level;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

/// Install the subscriber and the `log` bridge. Only the first call counts.
fn install(filter: EnvFilter, max_level: LevelFilter, with_location: bool) {
    INIT.call_once(|| {
        log::set_max_level(max_level);

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(with_location)
            .with_line_number(with_location)
            .with_level(true)
            .with_ansi(true)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Warning: Failed to install tracing subscriber: {}", e);
        }

        // Bridge log records into tracing once the subscriber is in place
        if let Err(e) = LogTracer::init() {
            eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
        }
    });
}

/// Initialize the global logger from `RUST_LOG` with source locations
pub fn init_logger() {
    install(EnvFilter::from_default_env(), LevelFilter::Debug, true);
}

/// Initialize the global logger at a fixed level
pub fn init_logger_with_level(level: Level) {
    install(EnvFilter::new(level.as_str()), level_filter(level), false);
}

/// Initialize the global logger from `RUST_LOG`, falling back to
/// `default_level` when it is unset
pub fn init_logger_with_env(default_level: &str) {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let max_level = directive.parse::<LevelFilter>().unwrap_or(LevelFilter::Trace);
    install(EnvFilter::new(directive), max_level, false);
}

fn level_filter(level: Level) -> LevelFilter {
    match level {
        Level::ERROR => LevelFilter::Error,
        Level::WARN => LevelFilter::Warn,
        Level::INFO => LevelFilter::Info,
        Level::DEBUG => LevelFilter::Debug,
        Level::TRACE => LevelFilter::Trace,
    }
}

/// Log a finished exchange as one JSON line (debug level only)
pub fn log_exchange(entry: &ExchangeLog) -> Result<()> {
    if log::log_enabled!(log::Level::Debug) {
        let line = serde_json::to_string(entry)?;
        log::debug!("EXCHANGE {}", line);
    }
    Ok(())
}

pub fn log_error(message: &str) {
    log::error!("{}", message);
}

pub fn log_info(message: &str) {
    log::info!("{}", message);
}

pub fn log_warning(message: &str) {
    log::warn!("{}", message);
}

pub fn log_debug(message: &str) {
    log::debug!("{}", message);
}

pub fn log_trace(message: &str) {
    log::trace!("{}", message);
}

/// Log an `ExchangeLog`; serialization failures are only warned about
#[macro_export]
macro_rules! log_connector_exchange {
    ($entry:expr) => {
        if let Err(e) = $crate::logging::log_exchange($entry) {
            $crate::logging::log_warning(&format!("Failed to log exchange: {}", e));
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_trace(&format!($($arg)*))
    };
}
