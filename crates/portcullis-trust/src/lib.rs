//! Trust utilities for the Portcullis proxy.
//!
//! This crate provides:
//! - Certificate/private-key loading with pair verification and leaf parsing
//! - Refresh scheduling as a fraction of the time left before expiry
//! - Stable cache keys for signed tokens

pub mod cache_key;
pub mod certificate;
pub mod error;
pub mod expiry;

pub use cache_key::cache_key;
pub use certificate::{load_certificate, LeafInfo, TrustedCertificate};
pub use error::TrustError;
pub use expiry::{refresh_within, refresh_within_at};
