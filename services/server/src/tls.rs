//! TLS acceptor construction for the RTSPS/RTMPS listeners.

use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("reading '{0}': {1}")]
    Io(String, std::io::Error),
    #[error("no certificates found in '{0}'")]
    NoCerts(String),
    #[error("no private key found in '{0}'")]
    NoKey(String),
    #[error("TLS configuration: {0}")]
    Config(String),
}

pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TlsError> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| TlsError::Io(cert_path.to_owned(), e))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Io(cert_path.to_owned(), e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts(cert_path.to_owned()));
    }

    let key_file =
        std::fs::File::open(key_path).map_err(|e| TlsError::Io(key_path.to_owned(), e))?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
            .map_err(|e| TlsError::Io(key_path.to_owned(), e))?
            .ok_or_else(|| TlsError::NoKey(key_path.to_owned()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
