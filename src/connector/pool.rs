//! Connection pooling for upstream destinations

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::ConnectorConfig;
use crate::connector::bridge::ResponseSink;
use crate::connector::connection::{Connection, ConnectionOptions, ConnectionState};
use crate::connector::socket_factory::SocketFactories;
use crate::error::Result;
use crate::models::Destination;
use crate::utils::log_capacity_exhausted;

/// Live connections, in creation order
#[derive(Default)]
pub struct ConnectionIndex {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, id: u64) {
        self.connections.lock().retain(|c| c.id() != id);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }
}

/// Aborts a placeholder connection if the caller stops waiting for its open
struct AbandonedOpen(Option<Arc<Connection>>);

impl AbandonedOpen {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonedOpen {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            debug!("Open of connection #{} abandoned", connection.id());
            connection.abort();
        }
    }
}

/// Pool bounds and per-connection policy
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_total_connections: Option<usize>,
    pub max_connections_per_destination: Option<usize>,
    /// Forward proxy every connection targets instead of the request's host
    pub proxy: Option<Destination>,
    pub connection: ConnectionOptions,
}

impl PoolSettings {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            max_total_connections: config.max_total_connections,
            max_connections_per_destination: config.max_connections_per_destination,
            proxy: config.proxy_destination(),
            connection: ConnectionOptions {
                pipeline_depth: config.pipeline_depth(),
                persistent: config.persisting_connections,
            },
        }
    }
}

enum Selection {
    Existing(Arc<Connection>),
    Created(Arc<Connection>),
    Exhausted { total: usize, for_destination: usize },
}

/// Chooses or creates the connection for each outgoing call
pub struct ConnectionPool {
    index: Arc<ConnectionIndex>,
    factories: SocketFactories,
    settings: PoolSettings,
    sink: Arc<ResponseSink>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, factories: SocketFactories, sink: Arc<ResponseSink>) -> Self {
        Self {
            index: Arc::new(ConnectionIndex::new()),
            factories,
            settings,
            sink,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Destination a request to `url` connects to, after proxy resolution.
    pub fn resolve_destination(&self, url: &Url) -> Result<Destination> {
        match &self.settings.proxy {
            Some(proxy) => Ok(proxy.clone()),
            None => Destination::from_url(url),
        }
    }

    /// Pick the connection for a call to `destination`.
    ///
    /// In order: the first open connection with room, a new connection while
    /// both bounds allow one, the least loaded busy connection (earliest
    /// created on ties). `Ok(None)` means the pool is at capacity; no socket
    /// was touched. An error means a new connection failed to open.
    pub async fn get_best_connection(
        &self,
        destination: &Destination,
        confidential: bool,
    ) -> Result<Option<Arc<Connection>>> {
        let selection = self.select(destination, confidential);

        match selection {
            Selection::Existing(connection) => {
                debug!("Reusing connection #{} to {}", connection.id(), destination);
                Ok(Some(connection))
            }
            Selection::Created(connection) => {
                let factory = self.factories.for_request(confidential);
                let guard = AbandonedOpen(Some(connection.clone()));
                let opened = connection.open(factory.as_ref()).await;
                guard.disarm();
                opened?;
                Ok(Some(connection))
            }
            Selection::Exhausted { total, for_destination } => {
                log_capacity_exhausted(destination, total, for_destination);
                Ok(None)
            }
        }
    }

    // Single pass under the index lock; a new connection is inserted in the
    // OPENING state before the lock is released so the bounds hold.
    fn select(&self, destination: &Destination, confidential: bool) -> Selection {
        let mut connections = self.index.connections.lock();
        let total = connections.len();
        let mut for_destination = 0;
        let mut fallback: Option<&Arc<Connection>> = None;

        for connection in connections.iter() {
            if connection.destination() != destination {
                continue;
            }
            for_destination += 1;

            if connection.is_secure() != confidential {
                continue;
            }
            if connection.can_enqueue() {
                return Selection::Existing(connection.clone());
            }
            if connection.accepts_more() {
                match fallback {
                    Some(best) if best.load() <= connection.load() => {}
                    _ => fallback = Some(connection),
                }
            }
        }

        let within_total = self.settings.max_total_connections.map_or(true, |max| total < max);
        let within_destination = self
            .settings
            .max_connections_per_destination
            .map_or(true, |max| for_destination < max);

        if within_total && within_destination {
            let connection = Arc::new(Connection::new(
                self.next_id.fetch_add(1, Ordering::Relaxed),
                destination.clone(),
                confidential,
                self.settings.connection,
                self.sink.clone(),
                Arc::downgrade(&self.index),
            ));
            connections.push(connection.clone());
            return Selection::Created(connection);
        }

        match fallback {
            Some(connection) => Selection::Existing(connection.clone()),
            None => Selection::Exhausted { total, for_destination },
        }
    }

    /// Close every connection, failing whatever is still queued on them.
    pub async fn stop(&self) {
        let connections = self.index.snapshot();
        debug!("Closing {} pooled connection(s)", connections.len());

        for connection in connections {
            connection.close().await;
        }
    }

    /// Live connections (any state short of removal)
    pub fn connection_count(&self) -> usize {
        self.index.len()
    }

    pub fn open_connection_count(&self) -> usize {
        self.index
            .snapshot()
            .iter()
            .filter(|c| c.state() == ConnectionState::Open)
            .count()
    }

    pub fn connections_for(&self, destination: &Destination) -> usize {
        self.index
            .snapshot()
            .iter()
            .filter(|c| c.destination() == destination)
            .count()
    }

    /// Connections created since the pool started
    pub fn connections_created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}
