//! Structured logging with JSON output.
//!
//! Logs go to stdout as one JSON object per line, or in a pretty format
//! during development.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type OutputLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when it holds valid directives.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = log_filter(std::env::var("RUST_LOG").ok(), &config.log_level);

    let output: OutputLayer = match config.log_format {
        // One flat object per event; the proxy does not open spans.
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_file(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(output.with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

fn log_filter(from_env: Option<String>, level: &str) -> EnvFilter {
    from_env
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

/// Standard log event names.
pub mod events {
    /// Proxy is starting up.
    pub const STARTUP: &str = "startup";

    /// Proxy is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// Proxy is listening on a port.
    pub const LISTENING: &str = "listening";

    /// Provider metadata was retrieved from the discovery endpoint.
    pub const PROVIDER_DISCOVERED: &str = "provider_discovered";

    /// Background provider sync failed.
    pub const PROVIDER_SYNC_FAILED: &str = "provider_sync_failed";

    /// An upgrade tunnel was established.
    pub const TUNNEL_OPENED: &str = "tunnel_opened";

    /// An upgrade tunnel finished relaying.
    pub const TUNNEL_CLOSED: &str = "tunnel_closed";

    /// An upgrade tunnel could not be established or broke mid-relay.
    pub const TUNNEL_FAILED: &str = "tunnel_failed";

    /// A session cookie was missing or failed to open.
    pub const SESSION_REJECTED: &str = "session_rejected";

    /// A client connection failed outside a tunnel.
    pub const CONNECTION_ERROR: &str = "connection_error";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_provider_discovered {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::PROVIDER_DISCOVERED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_provider_sync_failed {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::PROVIDER_SYNC_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_tunnel_opened {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::TUNNEL_OPENED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_tunnel_closed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::TUNNEL_CLOSED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_tunnel_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::TUNNEL_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_session_rejected {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SESSION_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_connection_error {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::CONNECTION_ERROR,
            $($field)*
        )
    };
}
