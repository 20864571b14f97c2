//! Identity provider client.
//!
//! Built once after discovery and shared for the lifetime of the process.
//! Cloning is cheap; all clones read the same provider snapshot slot.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::bootstrap::BootstrapConfig;
use crate::discovery::{Jwk, ProviderConfig};
use crate::error::OidcError;
use crate::sync::spawn_provider_sync;

/// Scopes always requested, after any configured ones.
pub const DEFAULT_SCOPES: [&str; 3] = ["openid", "email", "profile"];

/// Path appended to the redirection base.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Maximum bytes of a token endpoint error body kept in the error.
const MAX_ERROR_BODY: usize = 512;

/// Token endpoint response.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Handle for code exchange, token refresh and signing key lookup.
#[derive(Clone)]
pub struct IdentityClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: String,
    client_secret: String,
    redirect_url: Url,
    scopes: Vec<String>,
    http: reqwest::Client,
    provider: Arc<ArcSwap<ProviderConfig>>,
    sync: SyncHandle,
}

/// Owns the background sync task; stops it when the last client is dropped.
struct SyncHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}

impl fmt::Debug for IdentityClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityClient")
            .field("client_id", &self.inner.client_id)
            .field("redirect_url", &self.inner.redirect_url.as_str())
            .field("scopes", &self.inner.scopes)
            .field("issuer", &self.inner.provider.load().issuer())
            .finish_non_exhaustive()
    }
}

impl IdentityClient {
    /// Bind a client to a discovered provider and start its background sync.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &BootstrapConfig,
        http: reqwest::Client,
        provider: Arc<ProviderConfig>,
    ) -> Result<Self, OidcError> {
        let redirect_url = callback_url(&config.redirection_url)?;
        let scopes = merge_scopes(&config.scopes);
        Ok(Self::with_settings(config, redirect_url, scopes, http, provider))
    }

    /// [`IdentityClient::new`] with the callback URL and scopes already
    /// resolved.
    pub(crate) fn with_settings(
        config: &BootstrapConfig,
        redirect_url: Url,
        scopes: Vec<String>,
        http: reqwest::Client,
        provider: Arc<ProviderConfig>,
    ) -> Self {
        let provider = Arc::new(ArcSwap::new(provider));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_provider_sync(
            http.clone(),
            Arc::clone(&provider),
            config.sync.clone(),
            shutdown_rx,
        );

        Self {
            inner: Arc::new(ClientInner {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                redirect_url,
                scopes,
                http,
                provider,
                sync: SyncHandle { shutdown_tx, task },
            }),
        }
    }

    /// Current provider snapshot.
    pub fn provider_config(&self) -> Arc<ProviderConfig> {
        self.inner.provider.load_full()
    }

    /// Signing keys of the current snapshot.
    pub fn signing_keys(&self) -> Vec<Jwk> {
        self.inner.provider.load().keys.clone()
    }

    /// The OAuth client id.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The callback URL registered with the provider.
    pub fn redirect_url(&self) -> &str {
        self.inner.redirect_url.as_str()
    }

    /// Requested scopes, configured ones first.
    pub fn scopes(&self) -> &[String] {
        &self.inner.scopes
    }

    /// Stop the background sync. The current snapshot stays in place.
    pub fn stop_sync(&self) {
        let _ = self.inner.sync.shutdown_tx.send(true);
    }

    /// Authorization code flow redirect for a login attempt.
    pub fn authorization_url(&self, state: &str) -> Result<Url, OidcError> {
        let provider = self.inner.provider.load();
        let mut url = Url::parse(&provider.metadata.authorization_endpoint).map_err(|e| {
            OidcError::InvalidMetadata(format!("authorization_endpoint: {}", e))
        })?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.inner.client_id)
            .append_pair("redirect_uri", self.inner.redirect_url.as_str())
            .append_pair("scope", &self.inner.scopes.join(" "))
            .append_pair("state", state);

        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OidcError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.inner.redirect_url.as_str()),
        ])
        .await
    }

    /// Obtain fresh tokens with a refresh token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, OidcError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, OidcError> {
        let token_endpoint = self.inner.provider.load().metadata.token_endpoint.clone();

        let response = self
            .inner
            .http
            .post(&token_endpoint)
            .basic_auth(&self.inner.client_id, Some(&self.inner.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| OidcError::TokenRequest(format!("POST {}: {}", token_endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);
            tracing::warn!(
                token_endpoint = %token_endpoint,
                status = status.as_u16(),
                "Token endpoint rejected the request"
            );
            return Err(OidcError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| OidcError::TokenRequest(format!("invalid token response: {}", e)))
    }
}

/// Callback URL for a redirection base.
pub fn callback_url(redirection_url: &str) -> Result<Url, OidcError> {
    let joined = format!("{}{}", redirection_url.trim_end_matches('/'), CALLBACK_PATH);
    Url::parse(&joined).map_err(|e| OidcError::InvalidRedirectUrl(format!("{}: {}", joined, e)))
}

/// Configured scopes followed by the defaults, without duplicates.
pub fn merge_scopes(configured: &[String]) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::with_capacity(configured.len() + DEFAULT_SCOPES.len());

    for scope in configured.iter().map(String::as_str).chain(DEFAULT_SCOPES) {
        let scope = scope.trim();
        if !scope.is_empty() && !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }

    scopes
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
