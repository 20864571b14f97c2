//! Cache keys derived from signed tokens.

use sha2::{Digest, Sha256};

/// Stable lookup key for a token in its encoded (compact) form.
///
/// Hex-encoded SHA-256 of the encoded token. This is a map key, not a MAC:
/// never compare it in place of verifying the token.
pub fn cache_key(encoded_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encoded_token.as_bytes());
    hex::encode(hasher.finalize())
}
