//! Listener-side TLS.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read certificate: {0}")]
    Certificate(String),
    #[error("failed to read private key: {0}")]
    PrivateKey(String),
    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the acceptor from the configured certificate and key. Called
/// once at startup; sessions clone the acceptor.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert)
        .map_err(|e| TlsError::Certificate(e.to_string()))?
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| TlsError::PrivateKey(e.to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    info!(cert = %cert.display(), "TLS acceptor loaded");
    Ok(TlsAcceptor::from(Arc::new(config)))
}
