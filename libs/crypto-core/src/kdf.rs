use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, KEY_LEN};

/// Argon2id cost parameters.
///
/// Defaults follow the engine's production profile: 64 MiB of memory,
/// three passes, single lane. Tests use much smaller values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// A derived 256-bit key, zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Derive a 256-bit key from `secret` and `salt` with Argon2id.
///
/// Derivation is deterministic for a given (secret, salt, params) triple,
/// so a key can always be re-derived as long as the secret survives.
pub fn derive_key(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<KeyMaterial, CryptoError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::InvalidParams(e.to_string()))?;

    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(secret, salt, &mut out)
        .map_err(|e| CryptoError::InvalidParams(e.to_string()))?;
    Ok(KeyMaterial(out))
}
