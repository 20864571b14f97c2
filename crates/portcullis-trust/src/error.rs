//! Error types for trust material loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading certificate material.
#[derive(Debug, Error)]
pub enum TrustError {
    /// A certificate or key file is missing or unreadable.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The certificate file contains no PEM certificate.
    #[error("no certificate found in PEM input")]
    NoCertificate,

    /// The key file contains no PEM private key.
    #[error("no private key found in PEM input")]
    NoPrivateKey,

    /// The private key could not be decoded.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The leaf certificate is not valid DER.
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    /// The private key does not belong to the leaf certificate.
    #[error("certificate and private key do not match: {0}")]
    KeyPairMismatch(#[source] rustls::Error),

    /// Building the TLS configuration failed.
    #[error("failed to build TLS configuration: {0}")]
    Tls(#[source] rustls::Error),
}
