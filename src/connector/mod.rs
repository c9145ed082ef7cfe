//! HTTP client connector: socket factories, pooled connections and the
//! dispatcher that correlates responses with their callers

pub mod bridge;
pub mod call;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod pool;
pub mod socket_factory;

pub use bridge::{Completion, ResponseSink, Waiter};
pub use call::{AbortHandle, PendingCall};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use dispatcher::{CallOutcome, ClientDispatcher};
pub use pool::{ConnectionIndex, ConnectionPool, PoolSettings};
pub use socket_factory::{
    AsyncStream, BoxedStream, PlainSocketFactory, SecureSocketFactory, SocketFactories, SocketFactory,
    SocketFactoryProvider,
};

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::ConnectorConfig;
use crate::error::{Error, Result};
use crate::models::{CallResult, ClientRequest};

/// Connector counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectorStats {
    pub open_connections: usize,
    pub connections_created: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub calls_timed_out: u64,
    pub results_discarded: u64,
}

/// A started client connector
pub struct HttpConnector {
    config: ConnectorConfig,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<ClientDispatcher>,
    sink: Arc<ResponseSink>,
}

impl HttpConnector {
    /// Build both socket factories, the pool and the dispatcher.
    ///
    /// A TLS configuration the platform cannot honor is fatal here.
    pub fn start(config: ConnectorConfig) -> Result<Self> {
        let factories = SocketFactories::build(&config)?;
        Ok(Self::with_factories(config, factories))
    }

    pub fn with_factories(config: ConnectorConfig, factories: SocketFactories) -> Self {
        let sink = Arc::new(ResponseSink::new());
        let settings = PoolSettings::from_config(&config);

        if let Some(proxy) = &settings.proxy {
            info!("🔀 Routing every connection through proxy {}", proxy);
        }

        let pool = Arc::new(ConnectionPool::new(settings, factories, sink.clone()));
        let dispatcher = Arc::new(ClientDispatcher::new(pool.clone(), sink.clone(), config.response_timeout()));

        info!(
            "🚀 HTTP client connector started (max connections: {}, per destination: {}, pipelining: {})",
            limit_label(config.max_total_connections),
            limit_label(config.max_connections_per_destination),
            config.pipelining_connections
        );

        Self {
            config,
            pool,
            dispatcher,
            sink,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Dispatch a request; see [`ClientDispatcher::handle`].
    pub async fn handle(&self, request: ClientRequest) -> CallOutcome {
        self.dispatcher.handle(request).await
    }

    /// Dispatch a request and wait for its result, whatever its mode.
    pub async fn send(&self, request: ClientRequest) -> CallResult {
        if request.is_asynchronous() {
            return Err(Error::InvalidRequest(
                "send() waits for the result itself; drop the callback or use handle()".to_string(),
            ));
        }

        self.handle(request)
            .await
            .into_result()
            .unwrap_or_else(|| Err(Error::InvalidRequest("call did not complete".to_string())))
    }

    /// Close every connection. Calls still queued fail with a
    /// communication error.
    pub async fn stop(&self) {
        self.pool.stop().await;
        info!("🛑 HTTP client connector stopped");
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            open_connections: self.pool.open_connection_count(),
            connections_created: self.pool.connections_created(),
            calls_completed: self.sink.completed(),
            calls_failed: self.sink.failed(),
            calls_timed_out: self.sink.timed_out(),
            results_discarded: self.sink.discarded(),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!("📊 Connector statistics:");
        info!("   Open connections: {}", stats.open_connections);
        info!("   Connections created: {}", stats.connections_created);
        info!("   Calls completed: {}", stats.calls_completed);
        info!("   Calls failed: {}", stats.calls_failed);
        info!("   Calls timed out: {}", stats.calls_timed_out);
        info!("   Late results discarded: {}", stats.results_discarded);
    }
}

fn limit_label(limit: Option<usize>) -> String {
    limit.map_or_else(|| "unbounded".to_string(), |n| n.to_string())
}
