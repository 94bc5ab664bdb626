//! Certificate provisioning interface
//!
//! Acquisition and renewal live outside the core; the server only
//! needs something that can answer "what is the current certificate"
//! at TLS handshake time and can be handed a replacement during
//! rotation. `CertificateStore` is that seam, backed here by PEM
//! files named in the configuration.

use crate::carrier::CarrierError;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Hot-swappable server certificate resolved at handshake time
pub struct CertificateStore {
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertificateStore {
    /// Load the initial certificate chain and private key from PEM
    /// files
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self, CarrierError> {
        Ok(Self {
            current: RwLock::new(Arc::new(load_certified_key(cert_path, key_path)?)),
        })
    }

    /// Swap in a renewed certificate. Handshakes in progress keep the
    /// key they resolved; new handshakes see the replacement.
    pub fn replace<P: AsRef<Path>>(&self, cert_path: P, key_path: P) -> Result<(), CarrierError> {
        let renewed = Arc::new(load_certified_key(cert_path, key_path)?);
        if let Ok(mut current) = self.current.write() {
            *current = renewed;
        }
        Ok(())
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().ok().map(|current| current.clone())
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertificateStore")
    }
}

fn load_certified_key<P: AsRef<Path>>(
    cert_path: P,
    key_path: P,
) -> Result<CertifiedKey, CarrierError> {
    let mut cert_reader = BufReader::new(File::open(&cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CarrierError::Tls(format!("cannot parse certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(CarrierError::Tls(format!(
            "no certificates found in {}",
            cert_path.as_ref().display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(&key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| CarrierError::Tls(format!("cannot parse key PEM: {}", e)))?
        .ok_or_else(|| {
            CarrierError::Tls(format!(
                "no private key found in {}",
                key_path.as_ref().display()
            ))
        })?;

    let signing_key =
        any_supported_type(&key).map_err(|e| CarrierError::Tls(format!("unusable key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}
