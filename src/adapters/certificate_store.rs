//! PEM certificate store behind the [`CertificateResolver`] port.
//!
//! The index is swapped atomically on reload, so handshakes in progress keep
//! the certificate they resolved and new handshakes see the new set.

use std::{collections::HashMap, fs, io::BufReader, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use rustls::{
    crypto::aws_lc_rs::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
};

use crate::{
    config::CertificateConfig,
    ports::certificates::{CertificateError, CertificateResolver},
};

#[derive(Default)]
struct CertificateIndex {
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Keyed by the suffix after `*.`.
    wildcard: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl CertificateIndex {
    fn insert(&mut self, domains: &[String], key: Arc<CertifiedKey>, default: bool) {
        for domain in domains {
            let domain = domain.to_ascii_lowercase();
            match domain.strip_prefix("*.") {
                Some(suffix) => self.wildcard.insert(suffix.to_string(), key.clone()),
                None => self.exact.insert(domain, key.clone()),
            };
        }
        if default {
            self.default = Some(key);
        }
    }

    fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }
}

/// Certificates loaded from PEM files, resolved by exact name, then by
/// single-label wildcard, then the default certificate.
pub struct CertificateStore {
    index: ArcSwap<CertificateIndex>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.load();
        f.debug_struct("CertificateStore")
            .field("names", &index.len())
            .field("has_default", &index.default.is_some())
            .finish()
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self {
            index: ArcSwap::from_pointee(CertificateIndex::default()),
        }
    }
}

impl CertificateStore {
    /// Loads every configured certificate. Fails on the first unreadable one.
    pub fn load(certificates: &[CertificateConfig]) -> Result<Self, CertificateError> {
        let store = Self::default();
        store.reload(certificates)?;
        Ok(store)
    }

    /// Replaces the whole set. On error the previous set stays in place.
    pub fn reload(&self, certificates: &[CertificateConfig]) -> Result<(), CertificateError> {
        let mut index = CertificateIndex::default();
        for certificate in certificates {
            if certificate.domains.is_empty() && !certificate.default {
                return Err(CertificateError::NoDomain(
                    certificate.cert_file.display().to_string(),
                ));
            }
            let cert_pem = read(&certificate.cert_file)?;
            let key_pem = read(&certificate.key_file)?;
            let key = certified_key(
                &cert_pem,
                &key_pem,
                &certificate.cert_file,
                &certificate.key_file,
            )?;
            index.insert(&certificate.domains, Arc::new(key), certificate.default);
        }
        tracing::info!(
            certificates = certificates.len(),
            names = index.len(),
            "certificate store loaded"
        );
        self.index.store(Arc::new(index));
        Ok(())
    }

    /// Adds one certificate from PEM data already in memory.
    pub fn insert_pem(
        &self,
        domains: &[String],
        cert_pem: &[u8],
        key_pem: &[u8],
        default: bool,
    ) -> Result<(), CertificateError> {
        let key = certified_key(cert_pem, key_pem, Path::new("<memory>"), Path::new("<memory>"))?;
        let current = self.index.load();
        let mut index = CertificateIndex {
            exact: current.exact.clone(),
            wildcard: current.wildcard.clone(),
            default: current.default.clone(),
        };
        index.insert(domains, Arc::new(key), default);
        self.index.store(Arc::new(index));
        Ok(())
    }
}

impl CertificateResolver for CertificateStore {
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let index = self.index.load();
        let Some(name) = server_name else {
            return index.default.clone();
        };
        let name = name.to_ascii_lowercase();
        if let Some(key) = index.exact.get(&name) {
            return Some(key.clone());
        }
        if let Some((_, parent)) = name.split_once('.')
            && let Some(key) = index.wildcard.get(parent)
        {
            return Some(key.clone());
        }
        if index.default.is_none() {
            tracing::debug!(server_name = %name, "no certificate for server name");
        }
        index.default.clone()
    }

    fn is_empty(&self) -> bool {
        let index = self.index.load();
        index.len() == 0 && index.default.is_none()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn certified_key(
    cert_pem: &[u8],
    key_pem: &[u8],
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertifiedKey, CertificateError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<_, _>>()
        .map_err(|source| CertificateError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CertificateError::NoCertificate(cert_path.to_path_buf()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|source| CertificateError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey(key_path.to_path_buf()))?;
    let signing_key = any_supported_type(&key).map_err(|e| CertificateError::UnsupportedKey {
        path: key_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(CertifiedKey::new(chain, signing_key))
}
