use std::{path::PathBuf, sync::Arc};

use rustls::sign::CertifiedKey;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CertificateError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key in {path}: {reason}")]
    UnsupportedKey { path: PathBuf, reason: String },

    #[error("certificate has no usable name: {0}")]
    NoDomain(String),
}

/// Supplies the certificate to present for a TLS handshake.
///
/// Acquisition and rotation happen behind this trait; routers only ask.
pub trait CertificateResolver: Send + Sync + std::fmt::Debug + 'static {
    /// Certificate for the given SNI, or for a client that sent none.
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;

    /// True when no handshake could be answered.
    fn is_empty(&self) -> bool;
}
