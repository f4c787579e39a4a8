//! Scheduled retention work: message purge, inactivity auto-close, audit
//! purge, and final removal of expired archived conversations. `run_once`
//! is idempotent and leader-leased, so overlapping instances are harmless.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::RetentionConfig;
use crate::error::AppResult;
use crate::models::{CloseReason, ConversationStatus};
use crate::services::key_manager::KeyManager;
use crate::store::{ConversationStore, MessageStore};
use redis_utils::SharedConnectionManager;

/// Single-active-instance lease for the sweep. Duplicate execution is safe
/// either way; the lease only avoids wasted work.
#[async_trait]
pub trait SweepLock: Send + Sync {
    async fn try_acquire(&self, ttl: Duration) -> AppResult<bool>;
    async fn release(&self) -> AppResult<()>;
}

/// Redis `SET NX EX` lease shared across instances.
pub struct RedisSweepLock {
    redis: SharedConnectionManager,
    token: Uuid,
}

impl RedisSweepLock {
    const KEY: &'static str = "retention:sweep:lease";

    pub fn new(redis: SharedConnectionManager) -> Self {
        Self {
            redis,
            token: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl SweepLock for RedisSweepLock {
    async fn try_acquire(&self, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.redis.lock().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::KEY)
            .arg(self.token.to_string())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self) -> AppResult<()> {
        let mut conn = self.redis.lock().await;
        let holder: Option<String> = redis::cmd("GET")
            .arg(Self::KEY)
            .query_async(&mut *conn)
            .await?;
        if holder.as_deref() == Some(&self.token.to_string()) {
            let _: () = redis::cmd("DEL")
                .arg(Self::KEY)
                .query_async(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

/// Process-local lease for single-node deployments and tests.
#[derive(Default)]
pub struct MemorySweepLock {
    held: AtomicBool,
}

impl MemorySweepLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SweepLock for MemorySweepLock {
    async fn try_acquire(&self, _ttl: Duration) -> AppResult<bool> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    async fn release(&self) -> AppResult<()> {
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Another instance held the lease; nothing ran.
    pub skipped: bool,
    pub closed_for_inactivity: u64,
    pub purged_messages: u64,
    pub tombstoned_messages: u64,
    pub purged_conversations: u64,
    pub purged_audit_events: u64,
}

pub struct RetentionSweeper {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    keys: Arc<KeyManager>,
    audit: Arc<dyn AuditSink>,
    lock: Arc<dyn SweepLock>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        keys: Arc<KeyManager>,
        audit: Arc<dyn AuditSink>,
        lock: Arc<dyn SweepLock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            conversations,
            messages,
            keys,
            audit,
            lock,
            config,
        }
    }

    pub async fn run_once(&self) -> AppResult<SweepReport> {
        let lease_ttl = Duration::from_secs(self.config.sweep_interval_secs.max(60));
        if !self.lock.try_acquire(lease_ttl).await? {
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }
        let result = self.sweep().await;
        if let Err(e) = self.lock.release().await {
            tracing::warn!(error = %e, "sweep lease release failed");
        }
        result
    }

    async fn sweep(&self) -> AppResult<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        // One pass over every conversation: inactivity auto-close, message
        // purge, archived-conversation removal. One bad conversation never
        // stops the sweep. Stored day counts are clamped to the platform
        // ceilings so an out-of-bounds row can never widen the purge window.
        match self.conversations.list_all().await {
            Ok(all) => {
                for conversation in all {
                    if conversation.status == ConversationStatus::Open {
                        let idle_days = conversation
                            .auto_close_days
                            .clamp(1, self.config.max_auto_close_days);
                        if conversation.last_activity_at < now - ChronoDuration::days(idle_days) {
                            match self
                                .conversations
                                .update_status(
                                    conversation.id,
                                    ConversationStatus::Closed,
                                    Some(CloseReason::Inactivity),
                                )
                                .await
                            {
                                Ok(()) => {
                                    report.closed_for_inactivity += 1;
                                    tracing::info!(conversation_id = %conversation.id,
                                        "conversation auto-closed for inactivity");
                                }
                                Err(e) => tracing::error!(error = %e,
                                    conversation_id = %conversation.id, "auto-close failed"),
                            }
                        }
                    }

                    let retention_days = conversation
                        .retention_days
                        .clamp(1, self.config.max_retention_days);
                    let cutoff = now - ChronoDuration::days(retention_days);
                    match self.messages.purge_older_than(conversation.id, cutoff).await {
                        Ok(outcome) => {
                            report.purged_messages += outcome.purged;
                            report.tombstoned_messages += outcome.tombstoned;
                        }
                        Err(e) => {
                            tracing::error!(error = %e,
                                conversation_id = %conversation.id, "message purge failed");
                            continue;
                        }
                    }

                    if conversation.status == ConversationStatus::Archived
                        && conversation.last_activity_at < cutoff
                    {
                        match self.conversations.purge_conversation(conversation.id).await {
                            Ok(()) => {
                                // key goes last; after this the ciphertexts
                                // are unrecoverable
                                self.keys.destroy_key(conversation.id).await;
                                report.purged_conversations += 1;
                                tracing::info!(conversation_id = %conversation.id,
                                    "archived conversation purged, key destroyed");
                            }
                            Err(e) => tracing::error!(error = %e,
                                conversation_id = %conversation.id,
                                "conversation purge failed"),
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "conversation listing failed"),
        }

        // audit purge
        let audit_cutoff = now - ChronoDuration::days(self.config.audit_retention_days);
        match self.audit.purge_before(audit_cutoff).await {
            Ok(removed) => report.purged_audit_events = removed,
            Err(e) => tracing::error!(error = %e, "audit purge failed"),
        }

        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) if !report.skipped => tracing::info!(?report, "retention sweep done"),
                    Ok(_) => tracing::debug!("retention sweep skipped, lease held elsewhere"),
                    Err(e) => tracing::error!(error = %e, "retention sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, ConversationType, Participant, ParticipantRole};
    use crate::store::memory::MemoryStore;
    use crate::audit::MemoryAuditSink;
    use crypto_core::KdfParams;

    fn retention_config() -> RetentionConfig {
        RetentionConfig {
            message_retention_days: 730,
            max_retention_days: 3650,
            auto_close_days: 90,
            max_auto_close_days: 365,
            audit_retention_days: 2555,
            sweep_interval_secs: 3600,
        }
    }

    fn sweeper(store: Arc<MemoryStore>, keys: Arc<KeyManager>) -> RetentionSweeper {
        RetentionSweeper::new(
            store.clone(),
            store,
            keys,
            MemoryAuditSink::new(),
            MemorySweepLock::new(),
            retention_config(),
        )
    }

    fn keys() -> Arc<KeyManager> {
        Arc::new(KeyManager::new(
            b"test server secret, >= 32 bytes!".to_vec(),
            KdfParams {
                memory_kib: 8,
                iterations: 1,
                parallelism: 1,
            },
        ))
    }

    async fn seed_with(
        store: &MemoryStore,
        status: ConversationStatus,
        idle_days: i64,
        retention_days: i64,
        auto_close_days: i64,
    ) -> Uuid {
        let initiator = Uuid::new_v4();
        let id = Uuid::new_v4();
        let at = Utc::now() - ChronoDuration::days(idle_days);
        let conversation = Conversation {
            id,
            tenant_id: Uuid::new_v4(),
            topic: "t".into(),
            conversation_type: ConversationType::Group,
            context: None,
            initiator_id: initiator,
            status,
            close_reason: None,
            max_participants: 50,
            confidential: false,
            system_muted: false,
            retention_days,
            auto_close_days,
            metadata: serde_json::json!({}),
            created_at: at,
            last_activity_at: at,
        };
        let participant = Participant {
            conversation_id: id,
            user_id: initiator,
            role: ParticipantRole::Moderator,
            joined_at: at,
            muted: false,
            last_read_seq: 0,
        };
        store.insert_conversation(&conversation, &participant).await.unwrap();
        id
    }

    async fn seed(store: &MemoryStore, status: ConversationStatus, idle_days: i64) -> Uuid {
        seed_with(store, status, idle_days, 730, 90).await
    }

    #[tokio::test]
    async fn idle_91_days_is_closed_89_is_not() {
        let store = MemoryStore::new();
        let keys = keys();
        let old = seed(&store, ConversationStatus::Open, 91).await;
        let fresh = seed(&store, ConversationStatus::Open, 89).await;
        let sweeper = sweeper(store.clone(), keys);

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.closed_for_inactivity, 1);

        let closed = store.get_conversation(old).await.unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Inactivity));
        let open = store.get_conversation(fresh).await.unwrap();
        assert_eq!(open.status, ConversationStatus::Open);
    }

    #[tokio::test]
    async fn expired_archive_is_purged_and_key_destroyed() {
        let store = MemoryStore::new();
        let keys = keys();
        let id = seed(&store, ConversationStatus::Archived, 731).await;
        keys.create_key(id).await.unwrap();
        let sweeper = sweeper(store.clone(), keys.clone());

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.purged_conversations, 1);
        assert!(store.get_conversation(id).await.is_err());
        assert!(!keys.has_key(id).await);
    }

    #[tokio::test]
    async fn fresh_archive_survives_the_sweep() {
        let store = MemoryStore::new();
        let keys = keys();
        let id = seed(&store, ConversationStatus::Archived, 10).await;
        keys.create_key(id).await.unwrap();
        let sweeper = sweeper(store.clone(), keys.clone());

        sweeper.run_once().await.unwrap();
        assert!(store.get_conversation(id).await.is_ok());
        assert!(keys.has_key(id).await);
    }

    #[tokio::test]
    async fn run_once_is_idempotent() {
        let store = MemoryStore::new();
        let keys = keys();
        seed(&store, ConversationStatus::Open, 91).await;
        let sweeper = sweeper(store.clone(), keys);

        let first = sweeper.run_once().await.unwrap();
        assert_eq!(first.closed_for_inactivity, 1);
        let second = sweeper.run_once().await.unwrap();
        assert_eq!(second.closed_for_inactivity, 0);
    }

    #[tokio::test]
    async fn held_lease_skips_the_run() {
        let store = MemoryStore::new();
        let keys = keys();
        seed(&store, ConversationStatus::Open, 91).await;

        let lock = MemorySweepLock::new();
        assert!(lock.try_acquire(Duration::from_secs(60)).await.unwrap());

        let sweeper = RetentionSweeper::new(
            store.clone(),
            store.clone(),
            keys,
            MemoryAuditSink::new(),
            lock.clone(),
            retention_config(),
        );
        let report = sweeper.run_once().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn per_conversation_auto_close_overrides_the_default() {
        let store = MemoryStore::new();
        let keys = keys();
        let short = seed_with(&store, ConversationStatus::Open, 8, 730, 7).await;
        let long = seed_with(&store, ConversationStatus::Open, 91, 730, 180).await;
        let sweeper = sweeper(store.clone(), keys);

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.closed_for_inactivity, 1);
        assert_eq!(
            store.get_conversation(short).await.unwrap().status,
            ConversationStatus::Closed
        );
        assert_eq!(
            store.get_conversation(long).await.unwrap().status,
            ConversationStatus::Open
        );
    }

    #[tokio::test]
    async fn negative_retention_never_purges_fresh_messages() {
        let store = MemoryStore::new();
        let keys = keys();
        // A corrupt row with a nonsense retention value must be clamped, not
        // turned into a purge-everything cutoff in the future.
        let id = seed_with(&store, ConversationStatus::Open, 0, -10000, 90).await;
        let sender = Uuid::new_v4();
        let message = store.append(id, sender, vec![1, 2, 3]).await.unwrap();
        let sweeper = sweeper(store.clone(), keys);

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.purged_messages, 0);
        assert_eq!(report.tombstoned_messages, 0);
        assert!(store.get(message.id).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_retention_is_capped_at_the_platform_ceiling() {
        let store = MemoryStore::new();
        let keys = keys();
        let id = seed_with(&store, ConversationStatus::Open, 0, i64::MAX, 90).await;
        let sender = Uuid::new_v4();
        let old = store.append(id, sender, vec![9]).await.unwrap();
        store
            .backdate_message(old.id, Utc::now() - ChronoDuration::days(4000))
            .await
            .unwrap();
        let sweeper = sweeper(store.clone(), keys);

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.purged_messages + report.tombstoned_messages, 1);
    }
}
