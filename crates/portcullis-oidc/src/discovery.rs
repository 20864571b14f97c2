//! OpenID Connect discovery.
//!
//! Retrieves the provider's `/.well-known/openid-configuration` document and
//! the signing key set it points to, producing an immutable [`ProviderConfig`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CACHE_CONTROL};
use serde::{Deserialize, Serialize};

use crate::error::OidcError;

/// Path suffix of the discovery document.
pub const WELL_KNOWN_SUFFIX: &str = "/.well-known/openid-configuration";

/// Per-request timeout of the discovery HTTP client.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Partial OIDC discovery response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderMetadata {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub jwks_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Reject documents missing an endpoint the proxy depends on.
    pub fn validate(&self) -> Result<(), OidcError> {
        let required = [
            ("issuer", &self.issuer),
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("jwks_uri", &self.jwks_uri),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OidcError::InvalidMetadata(format!("missing {}", field)));
            }
        }

        Ok(())
    }
}

/// A JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    // RSA fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    // EC fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
}

/// JWKS document from the provider.
#[derive(Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// One snapshot of provider metadata and signing keys.
///
/// Never mutated after construction; the identity client swaps whole
/// snapshots when the background sync fetches a new one.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Normalized discovery URL this snapshot was fetched from.
    pub discovery_url: String,
    /// The discovery document.
    pub metadata: ProviderMetadata,
    /// Signing keys from `jwks_uri`.
    pub keys: Vec<Jwk>,
    /// When the discovery document was retrieved.
    pub fetched_at: DateTime<Utc>,
    /// Freshness limit advertised by `Cache-Control: max-age`, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProviderConfig {
    /// The provider's issuer identifier.
    pub fn issuer(&self) -> &str {
        &self.metadata.issuer
    }

    /// Find a signing key by key id.
    ///
    /// Without a `kid`, the first key is returned when the set holds exactly
    /// one.
    pub fn find_key(&self, kid: Option<&str>) -> Option<&Jwk> {
        match kid {
            Some(kid) => self.keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None if self.keys.len() == 1 => self.keys.first(),
            None => None,
        }
    }
}

/// Strip a trailing well-known suffix so the fetch can append its own.
pub fn normalize_discovery_url(url: &str) -> String {
    let trimmed = url.trim();
    trimmed
        .strip_suffix(WELL_KNOWN_SUFFIX)
        .unwrap_or(trimmed)
        .to_string()
}

/// Build the HTTP client used for discovery, key fetches and token requests.
///
/// Certificate verification is disabled only when `skip_tls_verify` is set.
pub fn build_http_client(
    skip_tls_verify: bool,
    request_timeout: Duration,
) -> Result<reqwest::Client, OidcError> {
    if skip_tls_verify {
        tracing::warn!("TLS verification of the OpenID provider is disabled");
    }

    reqwest::Client::builder()
        .danger_accept_invalid_certs(skip_tls_verify)
        .timeout(request_timeout)
        .user_agent(concat!("portcullis/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(OidcError::HttpClient)
}

/// Fetch the discovery document and signing keys for a normalized URL.
pub async fn fetch_provider_config(
    http: &reqwest::Client,
    discovery_url: &str,
) -> Result<ProviderConfig, OidcError> {
    let url = format!("{}{}", discovery_url.trim_end_matches('/'), WELL_KNOWN_SUFFIX);

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| OidcError::Discovery(format!("GET {}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(OidcError::Discovery(format!(
            "GET {} returned status {}",
            url, status
        )));
    }

    let max_age = cache_max_age(response.headers());

    let metadata: ProviderMetadata = response
        .json()
        .await
        .map_err(|e| OidcError::Discovery(format!("invalid discovery document: {}", e)))?;
    metadata.validate()?;

    let keys = fetch_signing_keys(http, &metadata.jwks_uri).await?;

    let fetched_at = Utc::now();
    let expires_at = max_age.and_then(|age| {
        chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| fetched_at.checked_add_signed(age))
    });

    Ok(ProviderConfig {
        discovery_url: discovery_url.to_string(),
        metadata,
        keys,
        fetched_at,
        expires_at,
    })
}

async fn fetch_signing_keys(http: &reqwest::Client, jwks_uri: &str) -> Result<Vec<Jwk>, OidcError> {
    let response = http
        .get(jwks_uri)
        .send()
        .await
        .map_err(|e| OidcError::JwksFetch(format!("GET {}: {}", jwks_uri, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(OidcError::JwksFetch(format!(
            "GET {} returned status {}",
            jwks_uri, status
        )));
    }

    let document: JwksDocument = response
        .json()
        .await
        .map_err(|e| OidcError::JwksFetch(format!("invalid JWKS document: {}", e)))?;

    Ok(document.keys)
}

/// Freshness lifetime from a `Cache-Control` header.
///
/// `no-store` and `no-cache` mean no usable lifetime.
pub(crate) fn cache_max_age(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(CACHE_CONTROL)?.to_str().ok()?;

    let mut max_age = None;
    for directive in value.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-store" || lower == "no-cache" {
            return None;
        }
        if let Some(seconds) = lower.strip_prefix("max-age=") {
            max_age = seconds.trim_matches('"').parse::<u64>().ok();
        }
    }

    max_age.map(Duration::from_secs)
}
