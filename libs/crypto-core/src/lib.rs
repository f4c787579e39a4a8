//! Symmetric crypto primitives shared by the conversation engine.
//!
//! Two concerns live here: authenticated encryption of message payloads
//! (AES-256-GCM) and derivation of per-conversation keys from a server
//! secret (Argon2id). Nothing in this crate touches storage or the network.

pub mod aead;
pub mod kdf;

pub use aead::{decrypt, encrypt, KEY_LEN, NONCE_LEN};
pub use kdf::{derive_key, KdfParams, KeyMaterial};

/// Errors surfaced by the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The ciphertext (or its tag) did not authenticate under the given key.
    #[error("ciphertext failed authentication")]
    AuthenticationFailed,

    #[error("encryption failure")]
    EncryptionFailure,

    #[error("invalid key derivation parameters: {0}")]
    InvalidParams(String),
}
