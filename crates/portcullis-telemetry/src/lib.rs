//! Observability for the Portcullis proxy.
//!
//! Structured JSON logging (or pretty output in development) with a fixed
//! vocabulary of event names shared by every crate in the workspace.
//!
//! # Usage
//!
//! ```ignore
//! use portcullis_telemetry::{Telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::new().with_log_level("debug");
//! let telemetry = Telemetry::init(config)?;
//! ```

pub mod config;
pub mod logging;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;

use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Main telemetry handle.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Initialize telemetry with the given configuration.
    ///
    /// Installs the global subscriber; a second call in the same process
    /// returns [`TelemetryError::LoggingInit`].
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;

        log_startup!(service = %config.service_name, "Telemetry initialized");

        Ok(Self { config })
    }

    /// Get the telemetry configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Log the shutdown event.
    pub fn shutdown(&self) {
        log_shutdown!(service = %self.config.service_name, "Shutting down");
    }
}
