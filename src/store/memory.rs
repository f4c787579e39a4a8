use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    CloseReason, Conversation, ConversationStatus, DeliveryStatus, Message, Participant,
};
use crate::store::{ConversationStore, MessageStore, PurgeOutcome};

/// Single-process store used by tests and dev runs without Postgres.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    rosters: HashMap<Uuid, Vec<Participant>>,
    /// Messages per conversation, ascending by sequence number.
    messages: HashMap<Uuid, Vec<Message>>,
    next_seq: HashMap<Uuid, i64>,
    /// message id -> recipient -> status
    receipts: HashMap<Uuid, HashMap<Uuid, DeliveryStatus>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fixture hook: rewrite a message's creation time so age-dependent
    /// behavior (edit window, retention) can be exercised without waiting.
    pub async fn backdate_message(
        &self,
        message_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .values_mut()
            .flatten()
            .find(|m| m.id == message_id)
            .ok_or(AppError::NotFound)?;
        message.created_at = created_at;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        owner: &Participant,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.conversations.insert(conversation.id, conversation.clone());
        inner.rosters.insert(conversation.id, vec![owner.clone()]);
        inner.messages.insert(conversation.id, Vec::new());
        inner.next_seq.insert(conversation.id, 0);
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation> {
        self.inner
            .read()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        reason: Option<CloseReason>,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(&id).ok_or(AppError::NotFound)?;
        conversation.status = status;
        if reason.is_some() {
            conversation.close_reason = reason;
        }
        Ok(())
    }

    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(&id).ok_or(AppError::NotFound)?;
        conversation.last_activity_at = at;
        Ok(())
    }

    async fn add_participant(&self, participant: &Participant) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let roster = inner
            .rosters
            .get_mut(&participant.conversation_id)
            .ok_or(AppError::NotFound)?;
        if roster.iter().any(|p| p.user_id == participant.user_id) {
            return Ok(false);
        }
        roster.push(participant.clone());
        Ok(true)
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let roster = inner
            .rosters
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let before = roster.len();
        roster.retain(|p| p.user_id != user_id);
        Ok(roster.len() < before)
    }

    async fn set_participant_muted(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted: bool,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let roster = inner
            .rosters
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let participant = roster
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(AppError::NotAParticipant)?;
        participant.muted = muted;
        Ok(())
    }

    async fn update_system_muted(&self, id: Uuid, muted: bool) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(&id).ok_or(AppError::NotFound)?;
        conversation.system_muted = muted;
        Ok(())
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        self.inner
            .read()
            .await
            .rosters
            .get(&conversation_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        Ok(self
            .inner
            .read()
            .await
            .rosters
            .get(&conversation_id)
            .and_then(|roster| roster.iter().find(|p| p.user_id == user_id).cloned()))
    }

    async fn set_last_read_seq(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        seq: i64,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let roster = inner
            .rosters
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let participant = roster
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(AppError::NotAParticipant)?;
        if seq > participant.last_read_seq {
            participant.last_read_seq = seq;
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Conversation> = inner
            .rosters
            .iter()
            .filter(|(_, roster)| roster.iter().any(|p| p.user_id == user_id))
            .filter_map(|(id, _)| inner.conversations.get(id).cloned())
            .collect();
        out.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(out)
    }

    async fn list_all(&self) -> AppResult<Vec<Conversation>> {
        Ok(self.inner.read().await.conversations.values().cloned().collect())
    }

    async fn purge_conversation(&self, id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.conversations.remove(&id);
        inner.rosters.remove(&id);
        inner.next_seq.remove(&id);
        if let Some(messages) = inner.messages.remove(&id) {
            for message in messages {
                inner.receipts.remove(&message.id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        ciphertext: Vec<u8>,
    ) -> AppResult<Message> {
        let mut inner = self.inner.write().await;
        let seq = {
            let counter = inner
                .next_seq
                .get_mut(&conversation_id)
                .ok_or(AppError::NotFound)?;
            *counter += 1;
            *counter
        };
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            sequence_number: seq,
            ciphertext,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        };
        inner
            .messages
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?
            .push(message.clone());
        Ok(message)
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Message> {
        self.inner
            .read()
            .await
            .messages
            .values()
            .flatten()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn update_ciphertext(
        &self,
        message_id: Uuid,
        ciphertext: Vec<u8>,
        edited_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .values_mut()
            .flatten()
            .find(|m| m.id == message_id)
            .ok_or(AppError::NotFound)?;
        message.ciphertext = ciphertext;
        message.edited_at = Some(edited_at);
        Ok(())
    }

    async fn tombstone(&self, message_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .values_mut()
            .flatten()
            .find(|m| m.id == message_id)
            .ok_or(AppError::NotFound)?;
        message.deleted = true;
        message.ciphertext.clear();
        Ok(())
    }

    async fn list_since(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let messages = inner.messages.get(&conversation_id).ok_or(AppError::NotFound)?;
        Ok(messages
            .iter()
            .filter(|m| m.sequence_number > since_seq)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, conversation_id: Uuid, last_read_seq: i64) -> AppResult<i64> {
        let inner = self.inner.read().await;
        let messages = inner.messages.get(&conversation_id).ok_or(AppError::NotFound)?;
        Ok(messages
            .iter()
            .filter(|m| m.sequence_number > last_read_seq && !m.deleted)
            .count() as i64)
    }

    async fn upsert_receipts(
        &self,
        message_id: Uuid,
        recipients: &[Uuid],
        status: DeliveryStatus,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.receipts.entry(message_id).or_default();
        for recipient in recipients {
            let current = entry.entry(*recipient).or_insert(status);
            if status > *current {
                *current = status;
            }
        }
        Ok(())
    }

    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let ids: Vec<Uuid> = inner
            .messages
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?
            .iter()
            .filter(|m| m.sequence_number <= up_to_seq)
            .map(|m| m.id)
            .collect();
        for id in ids {
            if let Some(per_recipient) = inner.receipts.get_mut(&id) {
                if let Some(status) = per_recipient.get_mut(&recipient_id) {
                    if *status < DeliveryStatus::Read {
                        *status = DeliveryStatus::Read;
                    }
                }
            }
        }
        Ok(())
    }

    async fn purge_older_than(
        &self,
        conversation_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> AppResult<PurgeOutcome> {
        let mut inner = self.inner.write().await;
        let mut outcome = PurgeOutcome::default();
        let Some(messages) = inner.messages.get(&conversation_id) else {
            return Ok(outcome);
        };

        let expired: Vec<(Uuid, bool)> = messages
            .iter()
            .filter(|m| m.created_at < cutoff && !m.deleted)
            .map(|m| (m.id, inner.receipts.get(&m.id).map_or(false, |r| !r.is_empty())))
            .collect();

        for (id, has_receipts) in expired {
            if has_receipts {
                let message = inner
                    .messages
                    .get_mut(&conversation_id)
                    .and_then(|v| v.iter_mut().find(|m| m.id == id));
                if let Some(message) = message {
                    message.deleted = true;
                    message.ciphertext.clear();
                    outcome.tombstoned += 1;
                }
            } else {
                if let Some(v) = inner.messages.get_mut(&conversation_id) {
                    v.retain(|m| m.id != id);
                }
                outcome.purged += 1;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(initiator: Uuid) -> (Conversation, Participant) {
        let id = Uuid::new_v4();
        let now = Utc::now();
        (
            Conversation {
                id,
                tenant_id: Uuid::new_v4(),
                topic: "test".into(),
                conversation_type: crate::models::ConversationType::Group,
                context: None,
                initiator_id: initiator,
                status: ConversationStatus::Open,
                close_reason: None,
                max_participants: 50,
                confidential: false,
                system_muted: false,
                retention_days: 730,
                auto_close_days: 90,
                metadata: serde_json::json!({}),
                created_at: now,
                last_activity_at: now,
            },
            Participant {
                conversation_id: id,
                user_id: initiator,
                role: crate::models::ParticipantRole::Moderator,
                joined_at: now,
                muted: false,
                last_read_seq: 0,
            },
        )
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_and_ascending() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let (conv, p) = conversation(owner);
        store.insert_conversation(&conv, &p).await.unwrap();

        for expected in 1..=5 {
            let m = store.append(conv.id, owner, vec![0u8; 8]).await.unwrap();
            assert_eq!(m.sequence_number, expected);
        }
    }

    #[tokio::test]
    async fn add_participant_is_idempotent() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let (conv, p) = conversation(owner);
        store.insert_conversation(&conv, &p).await.unwrap();

        let member = Participant {
            conversation_id: conv.id,
            user_id: Uuid::new_v4(),
            role: crate::models::ParticipantRole::Member,
            joined_at: Utc::now(),
            muted: false,
            last_read_seq: 0,
        };
        assert!(store.add_participant(&member).await.unwrap());
        assert!(!store.add_participant(&member).await.unwrap());
        assert_eq!(store.participants(conv.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mute_flags_round_trip() {
        let store = MemoryStore::new();
        let initiator = Uuid::new_v4();
        let (conv, p) = conversation(initiator);
        store.insert_conversation(&conv, &p).await.unwrap();

        store.set_participant_muted(conv.id, initiator, true).await.unwrap();
        assert!(store.participant(conv.id, initiator).await.unwrap().unwrap().muted);

        store.update_system_muted(conv.id, true).await.unwrap();
        assert!(store.get_conversation(conv.id).await.unwrap().system_muted);
    }

    #[tokio::test]
    async fn read_pointer_never_moves_backwards() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let (conv, p) = conversation(owner);
        store.insert_conversation(&conv, &p).await.unwrap();

        store.set_last_read_seq(conv.id, owner, 5).await.unwrap();
        store.set_last_read_seq(conv.id, owner, 3).await.unwrap();
        let participant = store.participant(conv.id, owner).await.unwrap().unwrap();
        assert_eq!(participant.last_read_seq, 5);
    }

    #[tokio::test]
    async fn purge_tombstones_messages_with_receipts() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let (conv, p) = conversation(owner);
        store.insert_conversation(&conv, &p).await.unwrap();

        let with_receipt = store.append(conv.id, owner, vec![1]).await.unwrap();
        let without_receipt = store.append(conv.id, owner, vec![2]).await.unwrap();
        store
            .upsert_receipts(with_receipt.id, &[reader], DeliveryStatus::Delivered)
            .await
            .unwrap();

        let outcome = store
            .purge_older_than(conv.id, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(outcome, PurgeOutcome { purged: 1, tombstoned: 1 });

        let survivor = store.get(with_receipt.id).await.unwrap();
        assert!(survivor.deleted);
        assert!(survivor.ciphertext.is_empty());
        assert!(matches!(store.get(without_receipt.id).await, Err(AppError::NotFound)));
    }
}
