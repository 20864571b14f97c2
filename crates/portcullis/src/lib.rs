//! Portcullis gateway library.
//!
//! This library exposes the configuration loader and connection handling
//! for testing purposes. The main entry point is the `portcullis` binary.

pub mod config;
pub mod gateway;

pub use config::{Config, ConfigError};
pub use gateway::{Gateway, SessionRejection, HEALTH_PATH};
