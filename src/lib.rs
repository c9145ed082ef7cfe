//! Rust HTTP Connector - pooled HTTP/1.1 client connector
//!
//! Turns outgoing requests into managed, pooled, plain or TLS connections,
//! writes them on the wire and hands each response back to the caller that
//! is waiting for it, or to its callback.

pub mod cli;
pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod models;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use config::settings::ConnectorConfig;
pub use connector::{AbortHandle, CallOutcome, ConnectorStats, HttpConnector};
pub use error::{Error, ErrorKind, Result};
pub use logging::{init_logger, init_logger_with_env, init_logger_with_level, log_debug, log_error, log_info, log_trace, log_warning};
pub use models::{CallResult, ClientRequest, ClientResponse, Destination, ExchangeLog};

/// Runtime utilities for creating single-threaded vs multi-threaded Tokio runtimes
pub mod runtime {
    use crate::config::settings::RuntimeConfig;
    use anyhow::{Context, Result};
    use tokio::runtime::{Builder, Runtime};
    use tracing::{info, warn};

    /// Create a Tokio runtime based on the configuration
    pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
        match config.mode.as_str() {
            "single_threaded" => {
                info!("🧵 Initializing single-threaded runtime");
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("Failed to create single-threaded runtime")
            }
            "multi_threaded" => {
                let mut builder = Builder::new_multi_thread();
                builder.enable_all();

                match config.worker_threads {
                    Some(threads) if threads > 0 => {
                        info!("🧵 Initializing multi-threaded runtime with {} worker threads", threads);
                        builder.worker_threads(threads);
                    }
                    _ => info!("🧵 Initializing multi-threaded runtime with auto-detected CPU cores"),
                }

                builder.build().context("Failed to create multi-threaded runtime")
            }
            _ => {
                warn!("⚠️  Unknown runtime mode '{}', defaulting to multi-threaded", config.mode);
                Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("Failed to create default multi-threaded runtime")
            }
        }
    }

    /// Execute an async function with the configured runtime
    pub fn run_with_runtime<F, T>(config: &RuntimeConfig, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let runtime = create_runtime(config)?;
        runtime.block_on(future)
    }

}
