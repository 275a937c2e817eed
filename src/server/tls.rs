//! Self-signed TLS for the enclave.
//!
//! No certificate authority is involved: the enclave generates a key pair at
//! startup and callers learn to trust the certificate by verifying an
//! attestation that binds its fingerprint.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio_native_tls::TlsAcceptor;

/// Certificate chain and key the enclave serves TLS with.
pub struct CertBundle {
    chain: Vec<Vec<u8>>,
    cert_pem: String,
    key_pem: String,
}

impl CertBundle {
    /// Generates a fresh self-signed certificate for `domain` (plus loopback names).
    pub fn generate(domain: &str) -> Result<Self> {
        let mut names = vec![domain.to_string()];
        for extra in ["localhost", "127.0.0.1"] {
            if !names.iter().any(|n| n == extra) {
                names.push(extra.to_string());
            }
        }
        let certified = rcgen::generate_simple_self_signed(names)
            .context("generating self-signed certificate")?;
        Ok(Self {
            chain: vec![certified.cert.der().to_vec()],
            cert_pem: certified.cert.pem(),
            key_pem: certified.key_pair.serialize_pem(),
        })
    }

    /// DER certificates, leaf first.
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// SHA-256 of the leaf certificate DER.
    pub fn fingerprint(&self) -> Vec<u8> {
        fingerprint(&self.chain[0])
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let identity =
            native_tls::Identity::from_pkcs8(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
                .context("loading TLS identity")?;
        let acceptor = native_tls::TlsAcceptor::new(identity).context("building TLS acceptor")?;
        Ok(TlsAcceptor::from(acceptor))
    }
}

pub fn fingerprint(der: &[u8]) -> Vec<u8> {
    Sha256::digest(der).to_vec()
}
