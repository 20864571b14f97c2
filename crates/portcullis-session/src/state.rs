//! Session state carried inside the encrypted cookie.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Refresh state sealed into the session cookie.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Refresh token issued by the identity provider.
    pub refresh_token: String,

    /// Instant after which the cookie is no longer honoured.
    pub expires_at: DateTime<Utc>,
}

impl SessionState {
    /// Create a new session state.
    pub fn new(refresh_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Returns true once `expires_at` has been reached.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock reading.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
