//! AES-GCM codec for session cookie values.
//!
//! A sealed value is laid out as `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! and hex-encoded so it can travel in a cookie. The key size picks the
//! cipher: 16 bytes for AES-128, 24 for AES-192, 32 for AES-256.

use std::fmt;

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};

use crate::error::SessionError;
use crate::state::SessionState;

/// AES-192 in Galois/Counter mode with the standard 96-bit nonce.
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Size of the GCM nonce prefixed to every sealed value.
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
pub const TAG_SIZE: usize = 16;

#[derive(Clone)]
enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl Cipher {
    fn new(key: &[u8]) -> Result<Self, SessionError> {
        let invalid = |_| SessionError::InvalidKey(key.len());

        match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(Cipher::Aes128).map_err(invalid),
            24 => Aes192Gcm::new_from_slice(key).map(Cipher::Aes192).map_err(invalid),
            32 => Aes256Gcm::new_from_slice(key).map(Cipher::Aes256).map_err(invalid),
            other => Err(SessionError::InvalidKey(other)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Cipher::Aes128(_) => "AES-128-GCM",
            Cipher::Aes192(_) => "AES-192-GCM",
            Cipher::Aes256(_) => "AES-256-GCM",
        }
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        let sealed = match self {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes192(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        };
        sealed.map_err(|_| SessionError::Encryption)
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        let opened = match self {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes192(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        };
        opened.map_err(|_| SessionError::InvalidSession)
    }
}

/// Session codec bound to a single symmetric key.
///
/// The key is validated once at construction, so a misconfigured key fails at
/// startup instead of on the first request.
#[derive(Clone)]
pub struct SessionCodec {
    cipher: Cipher,
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec")
            .field("cipher", &self.cipher.name())
            .finish_non_exhaustive()
    }
}

impl SessionCodec {
    /// Create a codec for the given key.
    ///
    /// Fails with [`SessionError::InvalidKey`] unless the key is 16, 24 or 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, SessionError> {
        Ok(Self {
            cipher: Cipher::new(key)?,
        })
    }

    /// Name of the AEAD construction in use (e.g. "AES-256-GCM").
    pub fn algorithm(&self) -> &'static str {
        self.cipher.name()
    }

    /// Encrypt `plaintext` under a fresh random nonce and hex-encode the result.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SessionError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| SessionError::Randomness(e.to_string()))?;

        self.encrypt_with_nonce(&nonce, plaintext)
    }

    /// Seal with a caller-chosen nonce. Only tests pin the nonce.
    pub(crate) fn encrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<String, SessionError> {
        let sealed = self.cipher.seal(nonce, plaintext)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(nonce);
        blob.extend_from_slice(&sealed);

        Ok(hex::encode(blob))
    }

    /// Decode and open a hex session value.
    pub fn decrypt(&self, text: &str) -> Result<Vec<u8>, SessionError> {
        let blob = hex::decode(text)?;

        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SessionError::InvalidSession);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher.open(nonce, ciphertext)
    }

    /// Seal a [`SessionState`] as JSON.
    pub fn seal_state(&self, state: &SessionState) -> Result<String, SessionError> {
        let payload = serde_json::to_vec(state)?;
        self.encrypt(&payload)
    }

    /// Open a sealed [`SessionState`], rejecting states whose lifetime has passed.
    pub fn open_state(&self, text: &str) -> Result<SessionState, SessionError> {
        let payload = self.decrypt(text)?;
        let state: SessionState =
            serde_json::from_slice(&payload).map_err(|_| SessionError::InvalidSession)?;

        if state.is_expired() {
            return Err(SessionError::Expired);
        }

        Ok(state)
    }
}

/// Encrypt `plaintext` under `key` and return the hex cookie value.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<String, SessionError> {
    SessionCodec::new(key)?.encrypt(plaintext)
}

/// Decrypt a hex cookie value produced by [`encrypt`].
pub fn decrypt(text: &str, key: &[u8]) -> Result<Vec<u8>, SessionError> {
    SessionCodec::new(key)?.decrypt(text)
}

/// Encrypt a UTF-8 session string for cookie storage.
pub fn encode_text(plaintext: &str, key: &str) -> Result<String, SessionError> {
    encrypt(plaintext.as_bytes(), key.as_bytes())
}

/// Decrypt a cookie value back into the session string.
///
/// A payload that is not valid UTF-8 is reported as an invalid session.
pub fn decode_text(state: &str, key: &str) -> Result<String, SessionError> {
    let plaintext = decrypt(state, key.as_bytes())?;
    String::from_utf8(plaintext).map_err(|_| SessionError::InvalidSession)
}
