//! Session cookie protection for the Portcullis proxy.
//!
//! Session state lives in a client cookie, so it is sealed with AES-GCM
//! under a process-wide key and hex-encoded for transport. Decryption never
//! tells a corrupt value apart from a tampered one.
//!
//! # Usage
//!
//! ```ignore
//! use portcullis_session::SessionCodec;
//!
//! let codec = SessionCodec::new(&key)?;
//! let cookie = codec.encrypt(b"payload")?;
//! let payload = codec.decrypt(&cookie)?;
//! ```

pub mod codec;
pub mod error;
pub mod state;

pub use codec::{
    decode_text, decrypt, encode_text, encrypt, SessionCodec, NONCE_SIZE, TAG_SIZE,
};
pub use error::SessionError;
pub use state::SessionState;
