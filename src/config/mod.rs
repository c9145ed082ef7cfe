//! Connector configuration

pub mod settings;

pub use settings::{ConnectorConfig, RuntimeConfig, TlsSettings, DEFAULT_PROXY_PORT};
