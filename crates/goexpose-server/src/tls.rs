//! Mutual TLS configuration for the control listener

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::config::TlsPaths;
use crate::error::TlsError;

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Server config that only completes handshakes with clients whose certificate
/// chains to the configured CA
pub fn build_server_config(paths: &TlsPaths) -> Result<Arc<ServerConfig>, TlsError> {
    ensure_crypto_provider();

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&paths.ca_cert)? {
        roots
            .add(ca)
            .map_err(|e| TlsError::InvalidCa(e.to_string()))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let certs = load_certs(&paths.server_cert)?;
    let key = load_private_key(&paths.server_key)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Who is on the other end of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Hex SHA-256 of the client's end-entity certificate
    pub fingerprint: String,
    pub peer_addr: SocketAddr,
}

impl ClientIdentity {
    pub fn from_certificate(cert: &CertificateDer<'_>, peer_addr: SocketAddr) -> Self {
        let digest = Sha256::digest(cert.as_ref());
        let fingerprint = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            fingerprint,
            peer_addr,
        }
    }

    /// Identity of a completed server-side handshake; None without a client certificate
    pub fn from_connection(
        connection: &rustls::ServerConnection,
        peer_addr: SocketAddr,
    ) -> Option<Self> {
        connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| Self::from_certificate(cert, peer_addr))
    }

    /// Identity for tunnels that were not established over TLS
    pub fn anonymous(peer_addr: SocketAddr) -> Self {
        Self {
            fingerprint: "anonymous".to_string(),
            peer_addr,
        }
    }

    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..self.fingerprint.len().min(16)]
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.short_fingerprint(), self.peer_addr)
    }
}
