//! TLS check CLI command: build the secure socket factory and optionally
//! handshake with a server

use crate::config::settings::ConnectorConfig;
use crate::connector::{SocketFactory, SocketFactoryProvider};
use crate::models::Destination;
use anyhow::{anyhow, Result};
use clap::Args;
use tracing::info;

#[derive(Debug, Args)]
pub struct TlsCheckArgs {
    /// PEM keystore with the client certificate chain and key
    #[arg(long)]
    pub keystore: Option<String>,

    /// PEM truststore with trusted CA certificates
    #[arg(long)]
    pub truststore: Option<String>,

    /// TLS protocol (TLS, TLSv1.2, TLSv1.3)
    #[arg(long)]
    pub protocol: Option<String>,

    /// Handshake with this host:port after building the factory
    #[arg(long)]
    pub connect: Option<String>,
}

impl TlsCheckArgs {
    pub fn to_config(&self, base: &ConnectorConfig) -> ConnectorConfig {
        let mut config = base.clone();
        if let Some(keystore) = &self.keystore {
            config.tls.keystore_path = Some(keystore.clone());
        }
        if let Some(truststore) = &self.truststore {
            config.tls.truststore_path = Some(truststore.clone());
        }
        if let Some(protocol) = &self.protocol {
            config.tls.ssl_protocol = protocol.clone();
        }
        config
    }

    pub async fn execute(&self, base: &ConnectorConfig) -> Result<()> {
        let config = self.to_config(base);

        let factory = SocketFactoryProvider::new(&config)
            .build_secure_factory()
            .map_err(|e| anyhow!("TLS configuration rejected: {}", e))?;

        println!("✅ Secure socket factory built (protocol: {})", config.tls.ssl_protocol);

        if let Some(target) = &self.connect {
            let destination = parse_destination(target)?;
            info!("🔐 Handshaking with {}", destination);

            factory
                .create_socket(&destination)
                .await
                .map_err(|e| anyhow!("Handshake with {} failed: {}", destination, e))?;

            println!("✅ TLS handshake with {} succeeded", destination);
        }

        Ok(())
    }
}

/// Parse `host:port`, defaulting the port to 443
pub fn parse_destination(target: &str) -> Result<Destination> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow!("Invalid port in '{}'", target))?;
            Ok(Destination::new(host.trim_start_matches('[').trim_end_matches(']'), port))
        }
        _ if !target.is_empty() => Ok(Destination::new(target, 443)),
        _ => Err(anyhow!("Empty destination")),
    }
}
