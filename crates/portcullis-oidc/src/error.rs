//! Error types for provider discovery and the identity client.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the OpenID provider.
#[derive(Debug, Error)]
pub enum OidcError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// The discovery document could not be retrieved.
    #[error("discovery request failed: {0}")]
    Discovery(String),

    /// The discovery document is missing required fields.
    #[error("invalid provider metadata: {0}")]
    InvalidMetadata(String),

    /// The signing key set could not be retrieved.
    #[error("failed to fetch signing keys: {0}")]
    JwksFetch(String),

    /// No configuration was obtained before the bootstrap deadline.
    #[error("failed to retrieve the provider configuration from {url} within {timeout:?}")]
    DiscoveryTimeout {
        /// The normalized discovery URL.
        url: String,
        /// The configured deadline.
        timeout: Duration,
    },

    /// The redirection base does not form a valid callback URL.
    #[error("invalid redirection url: {0}")]
    InvalidRedirectUrl(String),

    /// The token endpoint could not be reached or returned garbage.
    #[error("token request failed: {0}")]
    TokenRequest(String),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The discovery task ended without producing a result.
    #[error("discovery task failed: {0}")]
    Task(String),
}
