//! TLS configuration and certificate loading.

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;

/// TLS problems detected while preparing a listener.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate file not found: {0:?}")]
    CertificateNotFound(PathBuf),
    #[error("private key file not found: {0:?}")]
    KeyNotFound(PathBuf),
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("reading TLS material: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a listener gets its TLS identity from.
#[derive(Clone)]
pub enum TlsMaterial {
    /// PEM certificate chain and private key on disk.
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// A fully prepared rustls configuration.
    Config(RustlsConfig),
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMaterial::Files { cert_path, key_path } => f
                .debug_struct("Files")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            TlsMaterial::Config(_) => f.write_str("Config(..)"),
        }
    }
}

impl TlsMaterial {
    /// Resolve into a rustls configuration usable by `axum-server`.
    pub async fn resolve(&self) -> Result<RustlsConfig, TlsError> {
        match self {
            TlsMaterial::Files { cert_path, key_path } => load_tls_config(cert_path, key_path).await,
            TlsMaterial::Config(config) => Ok(config.clone()),
        }
    }
}

/// Load TLS configuration from certificate and key files.
///
/// Both files are parsed before being handed to rustls so that a missing
/// chain or key is reported precisely.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, TlsError> {
    if !cert_path.exists() {
        return Err(TlsError::CertificateNotFound(cert_path.to_path_buf()));
    }
    if !key_path.exists() {
        return Err(TlsError::KeyNotFound(key_path.to_path_buf()));
    }

    let cert_pem = tokio::fs::read(cert_path).await?;
    let key_pem = tokio::fs::read(key_path).await?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }
    if rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))?.is_none() {
        return Err(TlsError::NoPrivateKey(key_path.to_path_buf()));
    }

    Ok(RustlsConfig::from_pem(cert_pem, key_pem).await?)
}
