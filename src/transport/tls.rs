//! TLS termination for control and browser listeners

use super::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load TLS certificate chain from PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load TLS private key from PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path)))
}

/// Build a TLS acceptor from a certificate chain and key on disk
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
