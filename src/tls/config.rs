//! TLS client configuration for the secure socket factory

use crate::config::settings::TlsSettings;
use crate::error::{Error, Result};
use crate::tls::store::{add_system_root_certificates, load_identity, load_trust_store, ClientIdentity};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Certificate algorithm names accepted for compatibility; all map to WebPKI verification
const CERT_ALGORITHMS: &[&str] = &["SunX509", "PKIX", "X509"];

/// RNG names that designate the platform's system RNG
const SECURE_RANDOM_ALGORITHMS: &[&str] = &["NativePRNG", "SystemRandom", "DEFAULT"];

/// Security providers available to rustls
const SECURITY_PROVIDERS: &[&str] = &["ring"];

/// Create rustls ClientConfig from the connector's TLS settings
///
/// Unloadable key or trust material is logged and skipped. An unsupported
/// protocol, algorithm or provider is a fatal configuration error.
pub fn create_client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    debug!("Creating TLS client configuration");

    let versions = protocol_versions(&settings.ssl_protocol)?;
    validate_algorithms(settings)?;

    let identity = client_identity(settings);
    let root_store = trust_roots(settings);

    let builder = ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&versions)
        .map_err(|e| Error::TlsConfig(format!("Unable to create TLS context: {}", e)))?
        .with_root_certificates(root_store);

    let mut config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain, identity.key)
            .map_err(|e| Error::TlsConfig(format!("Unable to install client identity: {}", e)))?,
        None => builder.with_no_client_auth(),
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!("✅ TLS client configuration created");
    info!("   Protocol: {}", settings.ssl_protocol);

    Ok(Arc::new(config))
}

/// Map a protocol name onto the rustls versions it enables
pub fn protocol_versions(name: &str) -> Result<Vec<&'static SupportedProtocolVersion>> {
    match name.to_ascii_uppercase().as_str() {
        "TLS" => Ok(rustls::DEFAULT_VERSIONS.to_vec()),
        "TLSV1.2" => Ok(vec![&rustls::version::TLS12]),
        "TLSV1.3" => Ok(vec![&rustls::version::TLS13]),
        _ => Err(Error::TlsConfig(format!("Unsupported TLS protocol '{}'", name))),
    }
}

fn validate_algorithms(settings: &TlsSettings) -> Result<()> {
    if !contains_ignore_case(CERT_ALGORITHMS, &settings.cert_algorithm) {
        return Err(Error::TlsConfig(format!(
            "Unsupported certificate algorithm '{}'",
            settings.cert_algorithm
        )));
    }

    if let Some(algorithm) = &settings.secure_random_algorithm {
        if !contains_ignore_case(SECURE_RANDOM_ALGORITHMS, algorithm) {
            return Err(Error::TlsConfig(format!("Unsupported secure random algorithm '{}'", algorithm)));
        }
    }

    if let Some(provider) = &settings.security_provider {
        if !contains_ignore_case(SECURITY_PROVIDERS, provider) {
            return Err(Error::TlsConfig(format!("Unknown security provider '{}'", provider)));
        }
    }

    Ok(())
}

fn contains_ignore_case(names: &[&str], candidate: &str) -> bool {
    names.iter().any(|name| name.eq_ignore_ascii_case(candidate))
}

/// Client identity from the keystore, if one exists and loads
fn client_identity(settings: &TlsSettings) -> Option<ClientIdentity> {
    let path = settings.keystore_path()?;

    if !path.exists() {
        debug!("No key store at {}, continuing without client identity", path.display());
        return None;
    }

    match load_identity(&path, &settings.keystore_type) {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!("Unable to load the key store: {:#}", e);
            None
        }
    }
}

/// Trust roots: the truststore when it loads, otherwise the platform roots
fn trust_roots(settings: &TlsSettings) -> RootCertStore {
    if let Some(path) = settings.truststore_path() {
        if path.exists() {
            match load_trust_store(&path, &settings.truststore_type) {
                Ok(store) => return store,
                Err(e) => warn!("Unable to load the trust store: {:#}", e),
            }
        } else {
            warn!("Trust store {} does not exist", path.display());
        }
    }

    let mut root_store = RootCertStore::empty();
    if settings.use_native_roots {
        add_system_root_certificates(&mut root_store);
    }
    root_store
}
