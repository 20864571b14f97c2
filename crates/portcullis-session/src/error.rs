//! Error types for the session codec.

use thiserror::Error;

/// Errors that can occur while sealing or opening a session value.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The cookie text is not valid hexadecimal.
    #[error("session value is not valid hex: {0}")]
    Decode(#[from] hex::FromHexError),

    /// The value is too short, or failed authentication.
    ///
    /// Corrupt and tampered values both land here.
    #[error("invalid session")]
    InvalidSession,

    /// The session state decrypted correctly but its lifetime has passed.
    #[error("session has expired")]
    Expired,

    /// The symmetric key is not a supported AES key size.
    #[error("invalid session key length {0}: expected 16, 24 or 32 bytes")]
    InvalidKey(usize),

    /// The cipher refused to seal the payload.
    #[error("failed to encrypt session value")]
    Encryption,

    /// The operating system random source failed.
    #[error("secure random source failed: {0}")]
    Randomness(String),

    /// Session state could not be serialized.
    #[error("failed to serialize session state: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Returns true when the caller should treat the request as carrying no
    /// session and force re-authentication.
    pub fn rejects_session(&self) -> bool {
        matches!(
            self,
            SessionError::Decode(_) | SessionError::InvalidSession | SessionError::Expired
        )
    }
}
