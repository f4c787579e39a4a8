//! Storage seams for the engine. Two backends ship: Postgres (sqlx) for
//! production and an in-memory store for tests and single-node dev. The
//! stores never see plaintext; message bodies arrive already encrypted.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    CloseReason, Conversation, ConversationStatus, DeliveryStatus, Message, Participant,
};

/// Outcome of one conversation's message-retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Rows deleted outright.
    pub purged: u64,
    /// Rows kept as tombstones because delivery receipts still reference them.
    pub tombstoned: u64,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert a conversation together with its owner participant row.
    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        owner: &Participant,
    ) -> AppResult<()>;

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation>;

    async fn update_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        reason: Option<CloseReason>,
    ) -> AppResult<()>;

    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    /// Idempotent: returns `false` when the user was already on the roster.
    async fn add_participant(&self, participant: &Participant) -> AppResult<bool>;

    /// Returns `false` when the user was not on the roster.
    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn set_participant_muted(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted: bool,
    ) -> AppResult<()>;

    /// Administrator-level mute covering every participant.
    async fn update_system_muted(&self, id: Uuid, muted: bool) -> AppResult<()>;

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>>;

    async fn participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>>;

    /// Advance the participant's read pointer; never moves it backwards.
    async fn set_last_read_seq(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        seq: i64,
    ) -> AppResult<()>;

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>>;

    /// Every conversation, any status. Drives retention and key hydration.
    async fn list_all(&self) -> AppResult<Vec<Conversation>>;

    /// Remove the conversation and everything hanging off it.
    async fn purge_conversation(&self, id: Uuid) -> AppResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a ciphertext to the conversation, allocating the next
    /// sequence number. Caller holds the per-conversation lock.
    async fn append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        ciphertext: Vec<u8>,
    ) -> AppResult<Message>;

    async fn get(&self, message_id: Uuid) -> AppResult<Message>;

    async fn update_ciphertext(
        &self,
        message_id: Uuid,
        ciphertext: Vec<u8>,
        edited_at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Soft-delete: drop the ciphertext, keep the sequence slot.
    async fn tombstone(&self, message_id: Uuid) -> AppResult<()>;

    /// Messages with `sequence_number > since_seq`, ascending, capped at `limit`.
    async fn list_since(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    async fn unread_count(&self, conversation_id: Uuid, last_read_seq: i64) -> AppResult<i64>;

    /// Create or upgrade receipts for the message. Downgrades are ignored.
    async fn upsert_receipts(
        &self,
        message_id: Uuid,
        recipients: &[Uuid],
        status: DeliveryStatus,
    ) -> AppResult<()>;

    /// Upgrade this recipient's receipts to `read` for every message in the
    /// conversation up to and including `up_to_seq`.
    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<()>;

    /// Delete (or tombstone, when receipts remain) messages older than the
    /// cutoff in one conversation.
    async fn purge_older_than(
        &self,
        conversation_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> AppResult<PurgeOutcome>;
}
