//! Proxy configuration.
//!
//! Loaded from a single file: `.json` files are parsed as JSON, anything
//! else as YAML.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use portcullis_oidc::BootstrapConfig;
use portcullis_telemetry::LogFormat;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON or YAML for this schema.
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Proxy configuration file.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Where authorized upgrade requests are tunneled.
    pub upstream_url: String,

    /// OpenID provider discovery URL.
    pub discovery_url: String,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Public base URL of the proxy; `/oauth/callback` is appended.
    pub redirection_url: String,

    /// Extra scopes requested before `openid email profile`.
    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub skip_openid_provider_tls_verify: bool,

    /// Deadline for startup discovery, in seconds.
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    /// Session cookie key: 16, 24 or 32 bytes.
    pub encryption_key: String,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// PEM certificate chain for TLS termination.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS termination.
    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,

    /// Extra PEM CA bundle trusted for upstream TLS.
    #[serde(default)]
    pub upstream_ca: Option<PathBuf>,

    #[serde(default)]
    pub upstream_insecure_skip_verify: bool,

    /// Maximum request head size in bytes.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_discovery_timeout_secs() -> u64 {
    30
}

fn default_cookie_name() -> String {
    "_portcullis_session".to_string()
}

fn default_max_header_size() -> usize {
    portcullis_tunnel::DEFAULT_MAX_HEADER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("upstream_url", &self.upstream_url)
            .field("discovery_url", &self.discovery_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirection_url", &self.redirection_url)
            .field("scopes", &self.scopes)
            .field("encryption_key", &"<redacted>")
            .field("cookie_name", &self.cookie_name)
            .field("tls_cert", &self.tls_cert)
            .field("upstream_ca", &self.upstream_ca)
            .field("upstream_insecure_skip_verify", &self.upstream_insecure_skip_verify)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&content, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration content; the format follows the file extension.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            serde_json::from_str(content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(content).map_err(|e| e.to_string())
        };

        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Check values that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let upstream = parse_url("upstream_url", &self.upstream_url)?;
        if !matches!(upstream.host_str(), Some(host) if !host.is_empty()) {
            return Err(ConfigError::Invalid("upstream_url has no host".to_string()));
        }
        parse_url("discovery_url", &self.discovery_url)?;
        parse_url("redirection_url", &self.redirection_url)?;

        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("client_id is required".to_string()));
        }

        let key_len = self.encryption_key.len();
        if ![16, 24, 32].contains(&key_len) {
            return Err(ConfigError::Invalid(format!(
                "encryption_key must be 16, 24 or 32 bytes, got {}",
                key_len
            )));
        }

        if self.cookie_name.is_empty()
            || !self
                .cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::Invalid(format!(
                "cookie_name {:?} is not a valid cookie name",
                self.cookie_name
            )));
        }

        if self.tls_cert.is_some() != self.tls_private_key.is_some() {
            return Err(ConfigError::Invalid(
                "tls_cert and tls_private_key must be set together".to_string(),
            ));
        }

        if self.discovery_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.max_header_size < 1024 {
            return Err(ConfigError::Invalid(
                "max_header_size must be at least 1024 bytes".to_string(),
            ));
        }

        self.log_format()?;

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address: {}", self.listen)))
    }

    pub fn log_format(&self) -> Result<LogFormat, ConfigError> {
        LogFormat::parse(&self.log_format).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "log_format must be json or pretty, got {}",
                self.log_format
            ))
        })
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn terminates_tls(&self) -> bool {
        self.tls_cert.is_some()
    }

    /// Startup discovery settings derived from this configuration.
    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig::new(
            &self.discovery_url,
            &self.client_id,
            &self.client_secret,
            &self.redirection_url,
        )
        .with_scopes(self.scopes.clone())
        .with_skip_tls_verify(self.skip_openid_provider_tls_verify)
        .with_timeout(self.discovery_timeout())
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Invalid(format!("{} {:?}: {}", field, value, e)))
}
