//! OpenID Connect provider discovery for the Portcullis proxy.
//!
//! [`bootstrap`] retrieves the provider configuration at startup, retrying
//! until a deadline, and returns an [`IdentityClient`] whose provider
//! snapshot is refreshed in the background.

pub mod bootstrap;
pub mod client;
pub mod discovery;
pub mod error;
pub mod sync;

pub use bootstrap::{bootstrap, BootstrapConfig, RetryPolicy, DEFAULT_BOOTSTRAP_TIMEOUT};
pub use client::{IdentityClient, TokenResponse, DEFAULT_SCOPES};
pub use discovery::{
    build_http_client, fetch_provider_config, normalize_discovery_url, Jwk, ProviderConfig,
    ProviderMetadata,
};
pub use error::OidcError;
pub use sync::{next_sync_delay, spawn_provider_sync, SyncPolicy};
