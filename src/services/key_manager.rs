use crypto_core::{KdfParams, KeyMaterial};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Holds per-conversation symmetric keys. Keys are derived, never stored:
/// Argon2id over the server secret with the conversation id as salt, so a
/// restarted instance can re-derive every surviving key via [`hydrate`].
///
/// [`hydrate`]: KeyManager::hydrate
pub struct KeyManager {
    server_secret: Arc<Vec<u8>>,
    params: KdfParams,
    keys: RwLock<HashMap<Uuid, KeyMaterial>>,
}

impl KeyManager {
    pub fn new(server_secret: Vec<u8>, params: KdfParams) -> Self {
        Self {
            server_secret: Arc::new(server_secret),
            params,
            keys: RwLock::new(HashMap::new()),
        }
    }

    async fn derive(&self, conversation_id: Uuid) -> AppResult<KeyMaterial> {
        let secret = self.server_secret.clone();
        let params = self.params;
        // Argon2id at production cost pins a core for tens of milliseconds;
        // keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            crypto_core::derive_key(&secret, conversation_id.as_bytes(), &params)
        })
        .await
        .map_err(|_| AppError::Internal)?
        .map_err(AppError::from)
    }

    /// Derive and cache the key for a new conversation.
    pub async fn create_key(&self, conversation_id: Uuid) -> AppResult<()> {
        let key = self.derive(conversation_id).await?;
        self.keys.write().await.insert(conversation_id, key);
        Ok(())
    }

    /// Re-derive keys for surviving conversations after a restart.
    pub async fn hydrate(&self, conversation_ids: &[Uuid]) -> AppResult<()> {
        for &id in conversation_ids {
            if self.keys.read().await.contains_key(&id) {
                continue;
            }
            let key = self.derive(id).await?;
            self.keys.write().await.insert(id, key);
        }
        Ok(())
    }

    /// Drop the key material. Called only when the conversation is purged;
    /// after this its ciphertexts are unrecoverable.
    pub async fn destroy_key(&self, conversation_id: Uuid) {
        self.keys.write().await.remove(&conversation_id);
    }

    pub async fn has_key(&self, conversation_id: Uuid) -> bool {
        self.keys.read().await.contains_key(&conversation_id)
    }

    pub async fn encrypt(&self, conversation_id: Uuid, plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let keys = self.keys.read().await;
        let key = keys.get(&conversation_id).ok_or(AppError::KeyNotFound)?;
        Ok(crypto_core::encrypt(key.as_bytes(), plaintext)?)
    }

    /// Decrypt a stored blob. A missing key and a forged ciphertext are
    /// different failures and map to different errors.
    pub async fn decrypt(&self, conversation_id: Uuid, blob: &[u8]) -> AppResult<Vec<u8>> {
        let keys = self.keys.read().await;
        let key = keys.get(&conversation_id).ok_or(AppError::KeyNotFound)?;
        Ok(crypto_core::decrypt(key.as_bytes(), blob)?)
    }
}
