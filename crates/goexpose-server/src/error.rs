//! Server error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the server from starting or running
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Port pool error: {0}")]
    PortPool(#[from] crate::port_pool::PortPoolError),
}

/// Errors while preparing the mutual TLS configuration
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid CA certificate: {0}")]
    InvalidCa(String),

    #[error("Failed to build client certificate verifier: {0}")]
    Verifier(String),

    #[error("Invalid cert/key: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Errors while loading or validating the server configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
