//! Connector configuration settings

use crate::models::Destination;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Proxy port used when none is configured or the configured one is invalid
pub const DEFAULT_PROXY_PORT: u16 = 3128;

/// Main configuration for the client connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Log level configuration
    pub log_level: String,

    /// Host name of the forward proxy, if any
    pub proxy_host: Option<String>,

    /// Port of the forward proxy (kept as text, validated on use)
    pub proxy_port: Option<String>,

    /// Disable Nagle's algorithm on new sockets
    pub tcp_no_delay: bool,

    /// Enable SO_KEEPALIVE on new sockets
    pub socket_keep_alive: bool,

    /// TCP connect and TLS handshake timeout in milliseconds (0 = none)
    pub connect_timeout_ms: u64,

    /// How long a synchronous caller waits for its response, in milliseconds
    pub response_timeout_ms: u64,

    /// Upper bound on live connections (None = unbounded)
    pub max_total_connections: Option<usize>,

    /// Upper bound on live connections per destination (None = unbounded)
    pub max_connections_per_destination: Option<usize>,

    /// Keep connections open after an exchange
    pub persisting_connections: bool,

    /// Send further requests before earlier responses arrive
    pub pipelining_connections: bool,

    /// Per-connection queued plus in-flight limit when pipelining
    pub max_pipelined_messages: usize,

    /// TLS socket factory configuration
    pub tls: TlsSettings,

    /// Runtime configuration
    pub runtime: RuntimeConfig,
}

/// TLS configuration for the secure socket factory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM file with the client certificate chain and private key
    /// (defaults to `$HOME/.keystore`)
    pub keystore_path: Option<String>,

    /// Keystore password
    pub keystore_password: Option<String>,

    /// Keystore format
    pub keystore_type: String,

    /// Private key password
    pub key_password: Option<String>,

    /// Certificate algorithm name
    pub cert_algorithm: String,

    /// PEM bundle of trusted CA certificates
    pub truststore_path: Option<String>,

    /// Truststore format
    pub truststore_type: String,

    /// Truststore password
    pub truststore_password: Option<String>,

    /// Name of the RNG algorithm (None = platform default)
    pub secure_random_algorithm: Option<String>,

    /// Security provider name (None = platform default)
    pub security_provider: Option<String>,

    /// TLS protocol name
    pub ssl_protocol: String,

    /// Trust the platform root store when no truststore could be loaded
    pub use_native_roots: bool,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime mode: "single_threaded" or "multi_threaded"
    pub mode: String,

    /// Number of worker threads for multi-threaded mode (0 = auto-detect CPU cores)
    pub worker_threads: Option<usize>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            proxy_host: None,
            proxy_port: None,
            tcp_no_delay: false,
            socket_keep_alive: true,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 60_000,
            max_total_connections: None,
            max_connections_per_destination: None,
            persisting_connections: true,
            pipelining_connections: false,
            max_pipelined_messages: 4,
            tls: TlsSettings::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            keystore_path: None,
            keystore_password: None,
            keystore_type: "PEM".to_string(),
            key_password: None,
            cert_algorithm: "SunX509".to_string(),
            truststore_path: None,
            truststore_type: "PEM".to_string(),
            truststore_password: None,
            secure_random_algorithm: None,
            security_provider: None,
            ssl_protocol: "TLS".to_string(),
            use_native_roots: true,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "multi_threaded".to_string(),
            worker_threads: None,
        }
    }
}

impl TlsSettings {
    /// Keystore location, falling back to `.keystore` in the home directory.
    pub fn keystore_path(&self) -> Option<PathBuf> {
        match &self.keystore_path {
            Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
            Some(_) => None,
            None => std::env::var_os("HOME").map(|home| Path::new(&home).join(".keystore")),
        }
    }

    /// Truststore location, if one is configured.
    pub fn truststore_path(&self) -> Option<PathBuf> {
        self.truststore_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}

impl ConnectorConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: ConnectorConfig =
            serde_yaml::from_str(contents).context("Invalid connector configuration")?;
        Ok(config)
    }

    /// Load configuration from a YAML file (if present) with environment variable overrides
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_yaml_file(path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Build a configuration from defaults and environment variables only
    pub fn from_env_vars() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Override settings from `CONNECTOR_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.log_level = log_level;
        }

        if let Ok(host) = std::env::var("CONNECTOR_PROXY_HOST") {
            self.proxy_host = Some(host);
        }

        if let Ok(port) = std::env::var("CONNECTOR_PROXY_PORT") {
            self.proxy_port = Some(port);
        }

        if let Ok(no_delay) = std::env::var("CONNECTOR_TCP_NO_DELAY") {
            self.tcp_no_delay = no_delay.to_lowercase() == "true";
        }

        if let Ok(keep_alive) = std::env::var("CONNECTOR_SOCKET_KEEP_ALIVE") {
            self.socket_keep_alive = keep_alive.to_lowercase() == "true";
        }

        if let Ok(timeout) = std::env::var("CONNECTOR_CONNECT_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                self.connect_timeout_ms = timeout;
            }
        }

        if let Ok(timeout) = std::env::var("CONNECTOR_RESPONSE_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                self.response_timeout_ms = timeout;
            }
        }

        if let Ok(max) = std::env::var("CONNECTOR_MAX_TOTAL_CONNECTIONS") {
            self.max_total_connections = parse_limit(&max);
        }

        if let Ok(max) = std::env::var("CONNECTOR_MAX_CONNECTIONS_PER_DESTINATION") {
            self.max_connections_per_destination = parse_limit(&max);
        }

        if let Ok(persist) = std::env::var("CONNECTOR_PERSISTING_CONNECTIONS") {
            self.persisting_connections = persist.to_lowercase() == "true";
        }

        if let Ok(pipelining) = std::env::var("CONNECTOR_PIPELINING_CONNECTIONS") {
            self.pipelining_connections = pipelining.to_lowercase() == "true";
        }

        if let Ok(keystore) = std::env::var("CONNECTOR_KEYSTORE_PATH") {
            self.tls.keystore_path = Some(keystore);
        }

        if let Ok(truststore) = std::env::var("CONNECTOR_TRUSTSTORE_PATH") {
            self.tls.truststore_path = Some(truststore);
        }

        if let Ok(protocol) = std::env::var("CONNECTOR_SSL_PROTOCOL") {
            self.tls.ssl_protocol = protocol;
        }

        if let Ok(mode) = std::env::var("CONNECTOR_RUNTIME_MODE") {
            self.runtime.mode = mode;
        }
    }

    /// The proxy every connection goes through, if one is configured.
    pub fn proxy_destination(&self) -> Option<Destination> {
        let host = self.proxy_host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;

        let port = match self.proxy_port.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_PROXY_PORT,
            Some(text) => match text.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    warn!(
                        "The proxy port must be a valid numeric value, got '{}'; using {}",
                        text, DEFAULT_PROXY_PORT
                    );
                    DEFAULT_PROXY_PORT
                }
            },
        };

        Some(Destination::new(host, port))
    }

    /// Connect timeout, or None when disabled
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Synchronous response wait timeout
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Queued plus in-flight messages a connection accepts before it is busy
    pub fn pipeline_depth(&self) -> usize {
        if self.pipelining_connections {
            self.max_pipelined_messages.max(1)
        } else {
            1
        }
    }
}

/// Parse a connection limit where negative or empty values mean unbounded
fn parse_limit(text: &str) -> Option<usize> {
    text.trim().parse::<i64>().ok().filter(|n| *n >= 0).map(|n| n as usize)
}
