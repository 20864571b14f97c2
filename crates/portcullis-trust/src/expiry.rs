//! Refresh scheduling relative to an expiry instant.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Duration covering `fraction` of the time left until `expiry`.
///
/// Something expiring in an hour with a fraction of 0.8 yields 48 minutes.
/// The result is truncated to whole seconds and is zero once `expiry` has
/// passed. Fractions above 1 are treated as 1; non-positive or non-finite
/// fractions yield zero.
pub fn refresh_within(expiry: DateTime<Utc>, fraction: f64) -> Duration {
    refresh_within_at(expiry, fraction, Utc::now())
}

/// [`refresh_within`] against an explicit clock reading.
pub fn refresh_within_at(expiry: DateTime<Utc>, fraction: f64, now: DateTime<Utc>) -> Duration {
    let left = (expiry - now).num_milliseconds() as f64 / 1000.0;
    if left <= 0.0 || !fraction.is_finite() || fraction <= 0.0 {
        return Duration::ZERO;
    }

    let seconds = (left * fraction.min(1.0)) as u64;
    Duration::from_secs(seconds)
}
