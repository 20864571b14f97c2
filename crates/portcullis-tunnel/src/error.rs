//! Error types for upgrade tunneling.

use std::io;

use thiserror::Error;

/// Errors that can occur while taking over, dialing or relaying.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The client transport does not allow connection takeover.
    #[error("connection does not support takeover")]
    HijackUnsupported,

    /// The upstream URL cannot be dialed.
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    /// TCP connect to the upstream failed.
    #[error("failed to connect to upstream {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with the upstream failed.
    #[error("TLS handshake with upstream {address} failed: {source}")]
    Tls {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The upstream TLS client configuration is unusable.
    #[error("invalid upstream TLS configuration: {0}")]
    TlsConfig(#[source] rustls::Error),

    /// The extra CA bundle could not be read.
    #[error("invalid upstream CA bundle: {0}")]
    CaBundle(String),

    /// The request head exceeded the configured limit.
    #[error("request head exceeds {0} bytes")]
    HeaderTooLarge(usize),

    /// The request head is not valid HTTP/1.x.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The peer closed the connection before sending a request.
    #[error("connection closed before a request was received")]
    ConnectionClosed,

    /// Reading or writing one side of the tunnel failed.
    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}
