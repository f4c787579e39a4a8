//! Traits for the platform services this engine consumes. The engine never
//! implements tenant identity, push delivery, or audit storage itself; it
//! talks to them through these seams, which also makes tests self-contained.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis_utils::SharedConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppResult;

/// Platform role that may close or system-mute any conversation.
pub const ADMINISTRATOR_ROLE: &str = "administrator";

/// Resolves identity and platform-level capacity questions.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Is this user a member of the given tenant?
    async fn is_member(&self, user_id: Uuid, tenant_id: Uuid) -> AppResult<bool>;

    /// Does this user hold the named platform role?
    async fn has_role(&self, user_id: Uuid, role: &str) -> AppResult<bool>;

    /// May this user open another conversation under the platform cap?
    async fn within_open_conversation_cap(&self, user_id: Uuid) -> AppResult<bool>;
}

/// Identity resolver that admits everyone. Used for single-tenant
/// deployments and tests; production wires a gateway-backed resolver.
pub struct AllowAllIdentity;

#[async_trait]
impl IdentityResolver for AllowAllIdentity {
    async fn is_member(&self, _user_id: Uuid, _tenant_id: Uuid) -> AppResult<bool> {
        Ok(true)
    }

    async fn has_role(&self, _user_id: Uuid, _role: &str) -> AppResult<bool> {
        Ok(true)
    }

    async fn within_open_conversation_cap(&self, _user_id: Uuid) -> AppResult<bool> {
        Ok(true)
    }
}

/// What a queued notification tells the delivery service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// A single message the recipient missed while offline.
    OfflineMessage {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
    },
    /// Periodic summary of unread counts per conversation.
    Digest {
        unread: HashMap<Uuid, i64>,
        generated_at: DateTime<Utc>,
    },
}

/// Hands notifications to the delivery service (push, email, whatever the
/// deployment wires up).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue_notification(&self, user_id: Uuid, payload: NotificationPayload)
        -> AppResult<()>;
}

/// Redis list queue consumed by the delivery service.
pub struct RedisNotificationSink {
    redis: SharedConnectionManager,
    /// Queue entries expire if no consumer drains them.
    queue_ttl_secs: u64,
}

impl RedisNotificationSink {
    const QUEUE_PREFIX: &'static str = "notify:queue:";

    pub fn new(redis: SharedConnectionManager, queue_ttl_secs: u64) -> Self {
        Self { redis, queue_ttl_secs }
    }

    fn queue_key(user_id: Uuid) -> String {
        format!("{}{}", Self::QUEUE_PREFIX, user_id)
    }
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    async fn enqueue_notification(
        &self,
        user_id: Uuid,
        payload: NotificationPayload,
    ) -> AppResult<()> {
        let body = serde_json::to_string(&payload)
            .map_err(|e| crate::error::AppError::Database(format!("serialize notification: {e}")))?;
        let key = Self::queue_key(user_id);
        let mut conn = self.redis.lock().await;
        let _: () = conn.rpush(&key, body).await?;
        let _: () = conn.expire(&key, self.queue_ttl_secs as i64).await?;
        Ok(())
    }
}

/// In-memory sink for tests and single-node dev runs.
#[derive(Default)]
pub struct MemoryNotificationSink {
    delivered: Mutex<Vec<(Uuid, NotificationPayload)>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn drain(&self) -> Vec<(Uuid, NotificationPayload)> {
        let mut guard = self.delivered.lock().await;
        std::mem::take(&mut *guard)
    }

    pub async fn count_for(&self, user_id: Uuid) -> usize {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|(u, _)| *u == user_id)
            .count()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn enqueue_notification(
        &self,
        user_id: Uuid,
        payload: NotificationPayload,
    ) -> AppResult<()> {
        self.delivered.lock().await.push((user_id, payload));
        Ok(())
    }
}
