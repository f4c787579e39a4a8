use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lazily created per-conversation mutexes. Mutations to one conversation
/// serialize through its entry; different conversations never contend.
#[derive(Default, Clone)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Called opportunistically so
    /// the map does not grow with every conversation ever touched.
    pub async fn evict_idle(&self) {
        let mut map = self.inner.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
