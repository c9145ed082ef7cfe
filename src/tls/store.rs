//! Key and trust material loading for the secure socket factory

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, RootCertStore};
use rustls_pemfile::Item;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

/// Client certificate chain and its private key
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub chain: Vec<Certificate>,
    pub key: PrivateKey,
}

/// Read every PEM section of a key or trust store
fn read_pem_items(path: &Path, store_type: &str) -> Result<Vec<Item>> {
    if !store_type.eq_ignore_ascii_case("PEM") {
        return Err(anyhow!("Unsupported store type '{}', only PEM is supported", store_type));
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::read_all(&mut reader)
        .with_context(|| format!("Failed to parse PEM data in {}", path.display()))
}

/// Load the client identity (certificate chain plus private key) from a keystore
pub fn load_identity(path: &Path, store_type: &str) -> Result<ClientIdentity> {
    debug!("Loading key store from {}", path.display());

    let mut chain = Vec::new();
    let mut key = None;

    for item in read_pem_items(path, store_type)? {
        match item {
            Item::X509Certificate(der) => chain.push(Certificate(der)),
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                if key.is_none() {
                    key = Some(PrivateKey(der));
                }
            }
            _ => {}
        }
    }

    if chain.is_empty() {
        return Err(anyhow!("No certificate found in key store {}", path.display()));
    }

    let key = key.ok_or_else(|| anyhow!("No private key found in key store {}", path.display()))?;

    // Reject keys rustls cannot sign with before they reach the config builder
    rustls::sign::any_supported_type(&key)
        .map_err(|_| anyhow!("Unsupported private key type in {}", path.display()))?;

    info!("🔐 Loaded client identity from {} ({} certificate(s))", path.display(), chain.len());

    Ok(ClientIdentity { chain, key })
}

/// Load trusted CA certificates from a truststore
pub fn load_trust_store(path: &Path, store_type: &str) -> Result<RootCertStore> {
    debug!("Loading trust store from {}", path.display());

    let mut root_store = RootCertStore::empty();
    let mut added = 0;

    for item in read_pem_items(path, store_type)? {
        if let Item::X509Certificate(der) = item {
            root_store
                .add(&Certificate(der))
                .map_err(|e| anyhow!("Invalid CA certificate in {}: {:?}", path.display(), e))?;
            added += 1;
        }
    }

    if added == 0 {
        return Err(anyhow!("No CA certificate found in trust store {}", path.display()));
    }

    info!("📜 Loaded {} trusted certificate(s) from {}", added, path.display());

    Ok(root_store)
}

/// Add system root certificates to the root store
pub fn add_system_root_certificates(root_store: &mut RootCertStore) {
    debug!("Loading system root certificates");

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0;
            let mut failed = 0;

            for cert_der in certs {
                let cert = Certificate(cert_der.to_vec());

                match root_store.add(&cert) {
                    Ok(_) => added += 1,
                    Err(_) => failed += 1,
                }
            }

            debug!("Root certificate store initialized: {} added, {} rejected", added, failed);
        }
        Err(e) => {
            // Environments without a system store still get a usable (empty) store
            info!("⚠️  Could not load system root certificates: {}", e);
        }
    }
}
