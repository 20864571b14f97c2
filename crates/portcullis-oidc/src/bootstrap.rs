//! Resilient startup discovery.
//!
//! The proxy cannot validate anything until it knows the provider's
//! endpoints and keys. [`bootstrap`] retries discovery on its own task and
//! races it against a deadline; when the deadline wins the task is aborted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use portcullis_telemetry::log_provider_discovered;

use crate::client::{callback_url, merge_scopes, IdentityClient};
use crate::discovery::{
    build_http_client, fetch_provider_config, normalize_discovery_url, ProviderConfig,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::OidcError;
use crate::sync::SyncPolicy;

/// Default overall deadline for startup discovery.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between failed discovery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Pause after the first failure.
    pub interval: Duration,
    /// Growth factor applied per failure. `1.0` keeps the pause fixed.
    pub multiplier: f64,
    /// Upper bound on the pause.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

impl RetryPolicy {
    /// Retry at a constant interval.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Retry with exponential backoff up to `max_interval`.
    pub fn exponential(initial: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            interval: initial,
            multiplier,
            max_interval,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return current;
        }
        let grown = current.as_secs_f64() * self.multiplier;
        if grown >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(grown)
    }
}

/// Everything [`bootstrap`] needs to build an identity client.
#[derive(Clone)]
pub struct BootstrapConfig {
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Base URL; the callback path is appended.
    pub redirection_url: String,
    pub scopes: Vec<String>,
    pub skip_tls_verify: bool,
    /// Overall deadline for the first successful discovery.
    pub timeout: Duration,
    /// Per-request timeout of the HTTP client.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub sync: SyncPolicy,
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("discovery_url", &self.discovery_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirection_url", &self.redirection_url)
            .field("scopes", &self.scopes)
            .field("skip_tls_verify", &self.skip_tls_verify)
            .field("timeout", &self.timeout)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("sync", &self.sync)
            .finish()
    }
}

impl BootstrapConfig {
    /// Create a config with default timeouts, retry and sync policies.
    pub fn new(
        discovery_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirection_url: impl Into<String>,
    ) -> Self {
        Self {
            discovery_url: discovery_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirection_url: redirection_url.into(),
            scopes: Vec::new(),
            skip_tls_verify: false,
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            sync: SyncPolicy::default(),
        }
    }

    /// Set the configured scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Disable certificate verification of the provider.
    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }

    /// Set the overall discovery deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-request HTTP timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the background sync policy.
    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }
}

/// Discover the provider and build an identity client.
///
/// Fails with [`OidcError::DiscoveryTimeout`] when no attempt succeeds
/// before `config.timeout`. On success the client's background sync is
/// already running.
pub async fn bootstrap(
    config: BootstrapConfig,
) -> Result<(IdentityClient, Arc<ProviderConfig>), OidcError> {
    // Settings that cannot change between attempts fail before any request.
    let redirect_url = callback_url(&config.redirection_url)?;
    let scopes = merge_scopes(&config.scopes);

    let discovery_url = normalize_discovery_url(&config.discovery_url);
    let http = build_http_client(config.skip_tls_verify, config.request_timeout)?;

    let provider = Arc::new(
        discover_with_deadline(&http, &discovery_url, config.timeout, &config.retry).await?,
    );

    log_provider_discovered!(
        discovery_url = %discovery_url,
        issuer = %provider.issuer(),
        signing_keys = provider.keys.len(),
        "Retrieved OpenID provider configuration"
    );

    let client =
        IdentityClient::with_settings(&config, redirect_url, scopes, http, Arc::clone(&provider));

    Ok((client, provider))
}

async fn discover_with_deadline(
    http: &reqwest::Client,
    discovery_url: &str,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<ProviderConfig, OidcError> {
    let mut task = tokio::spawn(retry_discovery(
        http.clone(),
        discovery_url.to_string(),
        retry.clone(),
    ));

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(config)) => Ok(config),
        Ok(Err(join_error)) => Err(OidcError::Task(join_error.to_string())),
        Err(_) => {
            task.abort();
            tracing::error!(
                discovery_url = %discovery_url,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out retrieving the OpenID provider configuration"
            );
            Err(OidcError::DiscoveryTimeout {
                url: discovery_url.to_string(),
                timeout,
            })
        }
    }
}

async fn retry_discovery(
    http: reqwest::Client,
    discovery_url: String,
    retry: RetryPolicy,
) -> ProviderConfig {
    let mut delay = retry.interval;
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        tracing::info!(
            discovery_url = %discovery_url,
            attempt,
            "Attempting to retrieve OpenID provider configuration"
        );

        match fetch_provider_config(&http, &discovery_url).await {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!(
                    discovery_url = %discovery_url,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to retrieve OpenID provider configuration"
                );
            }
        }

        tokio::time::sleep(delay).await;
        delay = retry.next(delay);
    }
}
