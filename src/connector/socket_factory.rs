//! Plain and TLS socket factories
//!
//! Both factories are built once when the connector starts and are shared,
//! immutable, by every connection afterwards.

use async_trait::async_trait;
use rustls::ServerName;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::error::{Error, Result};
use crate::models::Destination;
use crate::tls::create_client_config;
use crate::utils::elapsed_ms;

/// Byte stream a connection runs over, plain or TLS
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens sockets to a destination
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Connect (and handshake, for TLS) within the configured connect timeout.
    async fn create_socket(&self, destination: &Destination) -> Result<BoxedStream>;

    fn is_secure(&self) -> bool;
}

/// TCP socket factory
#[derive(Debug, Clone)]
pub struct PlainSocketFactory {
    connect_timeout: Option<Duration>,
    tcp_no_delay: bool,
    keep_alive: bool,
}

impl PlainSocketFactory {
    pub fn new(connect_timeout: Option<Duration>, tcp_no_delay: bool, keep_alive: bool) -> Self {
        Self {
            connect_timeout,
            tcp_no_delay,
            keep_alive,
        }
    }

    /// Resolve and connect, trying each resolved address in turn.
    async fn connect(&self, destination: &Destination) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((destination.host.as_str(), destination.port))
            .await
            .map_err(|e| Error::UnresolvedHost(format!("{}: {}", destination.host, e)))?
            .collect();

        if addrs.is_empty() {
            return Err(Error::UnresolvedHost(destination.host.clone()));
        }

        let mut last_error = None;
        for addr in addrs {
            match within(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(stream) => {
                    self.apply_socket_options(&stream);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {} ({}) failed: {}", destination, addr, e);
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(Error::Connectivity(format!("unable to connect to {}: {}", destination, reason)))
    }

    fn apply_socket_options(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.tcp_no_delay) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        if let Err(e) = socket2::SockRef::from(stream).set_keepalive(self.keep_alive) {
            warn!("Failed to set SO_KEEPALIVE: {}", e);
        }
    }
}

#[async_trait]
impl SocketFactory for PlainSocketFactory {
    async fn create_socket(&self, destination: &Destination) -> Result<BoxedStream> {
        let stream = self.connect(destination).await?;
        Ok(Box::new(stream))
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// TLS socket factory layered over the plain one
pub struct SecureSocketFactory {
    tcp: PlainSocketFactory,
    connector: TlsConnector,
    handshake_timeout: Option<Duration>,
}

#[async_trait]
impl SocketFactory for SecureSocketFactory {
    async fn create_socket(&self, destination: &Destination) -> Result<BoxedStream> {
        let stream = self.tcp.connect(destination).await?;

        let server_name = ServerName::try_from(destination.host.as_str())
            .map_err(|_| Error::Connectivity(format!("invalid TLS server name '{}'", destination.host)))?;

        let started = Instant::now();
        let tls_stream = within(self.handshake_timeout, self.connector.connect(server_name, stream))
            .await
            .map_err(|e| Error::Connectivity(format!("TLS handshake with {} failed: {}", destination, e)))?;

        debug!("TLS handshake with {} completed in {}ms", destination, elapsed_ms(started));
        Ok(Box::new(tls_stream))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Run an I/O future under an optional timeout
async fn within<F, T>(timeout: Option<Duration>, future: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("timed out after {:?}", limit)))?,
        None => future.await,
    }
}

/// Builds the plain and TLS factories from connector configuration
pub struct SocketFactoryProvider<'a> {
    config: &'a ConnectorConfig,
}

impl<'a> SocketFactoryProvider<'a> {
    pub fn new(config: &'a ConnectorConfig) -> Self {
        Self { config }
    }

    pub fn build_plain_factory(&self) -> PlainSocketFactory {
        PlainSocketFactory::new(
            self.config.connect_timeout(),
            self.config.tcp_no_delay,
            self.config.socket_keep_alive,
        )
    }

    /// Fails only when the TLS context itself cannot be built.
    pub fn build_secure_factory(&self) -> Result<SecureSocketFactory> {
        let client_config = create_client_config(&self.config.tls)?;

        Ok(SecureSocketFactory {
            tcp: self.build_plain_factory(),
            connector: TlsConnector::from(client_config),
            handshake_timeout: self.config.connect_timeout(),
        })
    }
}

/// The pair of factories a connector hands its pool
#[derive(Clone)]
pub struct SocketFactories {
    pub plain: Arc<dyn SocketFactory>,
    pub secure: Arc<dyn SocketFactory>,
}

impl SocketFactories {
    pub fn build(config: &ConnectorConfig) -> Result<Self> {
        let provider = SocketFactoryProvider::new(config);
        let plain = provider.build_plain_factory();
        let secure = provider.build_secure_factory()?;

        info!(
            "🔌 Socket factories ready (connect timeout: {:?}, TCP_NODELAY: {})",
            config.connect_timeout(),
            config.tcp_no_delay
        );

        Ok(Self {
            plain: Arc::new(plain),
            secure: Arc::new(secure),
        })
    }

    pub fn for_request(&self, confidential: bool) -> &Arc<dyn SocketFactory> {
        if confidential {
            &self.secure
        } else {
            &self.plain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;
    use rustls::{Certificate, PrivateKey, ServerConfig};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    #[tokio::test]
    async fn test_plain_factory_connects_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let factory = PlainSocketFactory::new(Some(Duration::from_secs(5)), true, true);
        let mut stream = factory
            .create_socket(&Destination::new("127.0.0.1", port))
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert!(!factory.is_secure());
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_connectivity_error() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let factory = PlainSocketFactory::new(Some(Duration::from_secs(5)), false, true);
        let err = match factory.create_socket(&Destination::new("127.0.0.1", port)).await {
            Err(e) => e,
            Ok(_) => panic!("connect should have been refused"),
        };
        assert!(matches!(err, Error::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_secure_factory_handshakes_with_trusted_server() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let server_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![Certificate(cert.serialize_der().unwrap())],
                PrivateKey(cert.serialize_private_key_der()),
            )
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(socket).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(b"pong").await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut truststore = NamedTempFile::new().unwrap();
        truststore.write_all(cert.serialize_pem().unwrap().as_bytes()).unwrap();

        let config = ConnectorConfig {
            tls: TlsSettings {
                keystore_path: Some(String::new()),
                truststore_path: Some(truststore.path().to_string_lossy().to_string()),
                use_native_roots: false,
                ..TlsSettings::default()
            },
            ..ConnectorConfig::default()
        };

        let factory = SocketFactoryProvider::new(&config).build_secure_factory().unwrap();
        assert!(factory.is_secure());

        let mut stream = factory
            .create_socket(&Destination::new("localhost", port))
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_unknown_host_is_unresolved() {
        let factory = PlainSocketFactory::new(Some(Duration::from_secs(5)), false, false);
        let err = match factory.create_socket(&Destination::new("no-such-host.invalid", 80)).await {
            Err(e) => e,
            Ok(_) => panic!("resolution should have failed"),
        };
        assert!(matches!(err, Error::UnresolvedHost(_)));
    }

    #[test]
    fn test_provider_rejects_bad_protocol() {
        let mut config = ConnectorConfig::default();
        config.tls.ssl_protocol = "SSLv2".to_string();
        config.tls.keystore_path = Some(String::new());
        config.tls.use_native_roots = false;
        assert!(matches!(SocketFactories::build(&config), Err(Error::TlsConfig(_))));
    }
}
