//! Conversation lifecycle, roster, authorization, and the message write
//! path. Every mutation of one conversation runs under its entry in the
//! per-conversation lock map; reads go straight to the stores.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditTrail};
use crate::collaborators::{IdentityResolver, ADMINISTRATOR_ROLE};
use crate::error::{AppError, AppResult};
use crate::models::{
    CloseReason, ContextRef, Conversation, ConversationStatus, ConversationType, DeliveryStatus,
    Message, Participant, ParticipantRole,
};
use crate::presence::PresenceRegistry;
use crate::services::key_manager::KeyManager;
use crate::services::locks::ConversationLocks;
use crate::services::notification_dispatcher::NotificationDispatcher;
use crate::services::rate_limiter::RateLimiter;
use crate::store::{ConversationStore, MessageStore};
use crate::websocket::events::PushFrame;

/// A decrypted message as handed to clients. Tombstones keep their slot in
/// the sequence but carry no plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sequence_number: i64,
    pub plaintext: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread: i64,
}

/// Caller-supplied settings for a new conversation, each validated against
/// the platform-wide ceilings in [`ConversationPolicy`].
#[derive(Debug, Clone, Default)]
pub struct ConversationOptions {
    pub confidential: bool,
    pub retention_days: Option<i64>,
    pub auto_close_days: Option<i64>,
    pub max_participants: Option<usize>,
    pub metadata: Option<serde_json::Value>,
}

/// Platform-wide defaults and ceilings, sourced from configuration.
#[derive(Debug, Clone)]
pub struct ConversationPolicy {
    pub max_participants: usize,
    pub edit_window_minutes: i64,
    pub default_retention_days: i64,
    pub max_retention_days: i64,
    pub default_auto_close_days: i64,
    pub max_auto_close_days: i64,
}

pub struct ConversationService {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    keys: Arc<KeyManager>,
    limiter: Arc<RateLimiter>,
    presence: PresenceRegistry,
    dispatcher: NotificationDispatcher,
    identity: Arc<dyn IdentityResolver>,
    audit: AuditTrail,
    locks: ConversationLocks,
    policy: ConversationPolicy,
    edit_window: Duration,
}

#[allow(clippy::too_many_arguments)]
impl ConversationService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        keys: Arc<KeyManager>,
        limiter: Arc<RateLimiter>,
        presence: PresenceRegistry,
        dispatcher: NotificationDispatcher,
        identity: Arc<dyn IdentityResolver>,
        audit: AuditTrail,
        policy: ConversationPolicy,
    ) -> Self {
        let edit_window = Duration::minutes(policy.edit_window_minutes);
        Self {
            conversations,
            messages,
            keys,
            limiter,
            presence,
            dispatcher,
            identity,
            audit,
            locks: ConversationLocks::new(),
            policy,
            edit_window,
        }
    }

    async fn require_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Participant> {
        self.conversations
            .participant(conversation_id, user_id)
            .await?
            .ok_or(AppError::NotAParticipant)
    }

    fn require_open(conversation: &Conversation) -> AppResult<()> {
        if conversation.is_open() {
            Ok(())
        } else {
            Err(AppError::ConversationClosed)
        }
    }

    async fn require_moderator(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant> {
        let participant = self.require_participant(conversation_id, user_id).await?;
        if participant.role != ParticipantRole::Moderator {
            return Err(AppError::NotOwner);
        }
        Ok(participant)
    }

    /// Lifecycle actions are open to a moderator participant or a platform
    /// administrator acting from outside the roster.
    async fn require_manager(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        if let Some(participant) = self.conversations.participant(conversation_id, user_id).await? {
            if participant.role == ParticipantRole::Moderator {
                return Ok(());
            }
        }
        if self.identity.has_role(user_id, ADMINISTRATOR_ROLE).await? {
            return Ok(());
        }
        Err(AppError::NotOwner)
    }

    async fn roster_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self
            .conversations
            .participants(conversation_id)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect())
    }

    pub async fn create_conversation(
        &self,
        creator: Uuid,
        tenant_id: Uuid,
        conversation_type: ConversationType,
        context: Option<ContextRef>,
        topic: String,
        options: ConversationOptions,
    ) -> AppResult<Conversation> {
        if !self.identity.is_member(creator, tenant_id).await? {
            return Err(AppError::Unauthorized);
        }
        if topic.trim().is_empty() {
            return Err(AppError::BadRequest("topic must not be empty".into()));
        }
        if conversation_type.requires_context() && context.is_none() {
            return Err(AppError::InvalidType);
        }
        if context.is_some() && !conversation_type.requires_context() {
            return Err(AppError::BadRequest(
                "context only applies to contextual conversations".into(),
            ));
        }
        if !self.identity.within_open_conversation_cap(creator).await? {
            return Err(AppError::LimitExceeded);
        }

        let retention_days = options
            .retention_days
            .unwrap_or(self.policy.default_retention_days);
        if retention_days < 1 || retention_days > self.policy.max_retention_days {
            return Err(AppError::BadRequest(format!(
                "retention_days must be between 1 and {}",
                self.policy.max_retention_days
            )));
        }
        let auto_close_days = options
            .auto_close_days
            .unwrap_or(self.policy.default_auto_close_days);
        if auto_close_days < 1 || auto_close_days > self.policy.max_auto_close_days {
            return Err(AppError::BadRequest(format!(
                "auto_close_days must be between 1 and {}",
                self.policy.max_auto_close_days
            )));
        }
        let max_participants = match conversation_type {
            ConversationType::Direct => 2,
            _ => {
                let requested = options
                    .max_participants
                    .unwrap_or(self.policy.max_participants);
                if requested < 2 || requested > self.policy.max_participants {
                    return Err(AppError::BadRequest(format!(
                        "max_participants must be between 2 and {}",
                        self.policy.max_participants
                    )));
                }
                requested
            }
        };

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            tenant_id,
            topic,
            conversation_type,
            context,
            initiator_id: creator,
            status: ConversationStatus::Open,
            close_reason: None,
            max_participants,
            confidential: options.confidential,
            system_muted: false,
            retention_days,
            auto_close_days,
            metadata: options.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            last_activity_at: now,
        };
        let initiator = Participant {
            conversation_id: conversation.id,
            user_id: creator,
            role: ParticipantRole::Moderator,
            joined_at: now,
            muted: false,
            last_read_seq: 0,
        };

        // Key first: a conversation row without a key would strand writes.
        self.keys.create_key(conversation.id).await?;
        if let Err(e) = self
            .conversations
            .insert_conversation(&conversation, &initiator)
            .await
        {
            self.keys.destroy_key(conversation.id).await;
            return Err(e);
        }

        self.audit.record(AuditEvent::new(
            creator,
            "conversation.create",
            "conversation",
            conversation.id,
        ));
        tracing::info!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    pub async fn get_conversation(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<(Conversation, Vec<Participant>)> {
        self.require_participant(conversation_id, caller).await?;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        let participants = self.conversations.participants(conversation_id).await?;
        Ok((conversation, participants))
    }

    /// Active listing: archived conversations are excluded.
    pub async fn list_conversations(&self, caller: Uuid) -> AppResult<Vec<ConversationSummary>> {
        let mut out = Vec::new();
        for conversation in self.conversations.list_for_user(caller).await? {
            if conversation.status == ConversationStatus::Archived {
                continue;
            }
            let unread = match self.conversations.participant(conversation.id, caller).await? {
                Some(p) => {
                    self.messages
                        .unread_count(conversation.id, p.last_read_seq)
                        .await?
                }
                None => 0,
            };
            out.push(ConversationSummary { conversation, unread });
        }
        Ok(out)
    }

    pub async fn add_participant(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> AppResult<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Self::require_open(&conversation)?;
        self.require_moderator(conversation_id, caller).await?;
        if !self.identity.is_member(user_id, conversation.tenant_id).await? {
            return Err(AppError::BadRequest("user is not a tenant member".into()));
        }

        let roster = self.conversations.participants(conversation_id).await?;
        if roster.iter().any(|p| p.user_id == user_id) {
            // idempotent re-add
            return Ok(());
        }
        if roster.len() >= conversation.max_participants {
            return Err(AppError::RosterFull);
        }

        let participant = Participant {
            conversation_id,
            user_id,
            role,
            joined_at: Utc::now(),
            muted: false,
            last_read_seq: 0,
        };
        if !self.conversations.add_participant(&participant).await? {
            return Ok(());
        }

        let frame = PushFrame::participant_joined(conversation_id, user_id);
        let recipients = self.roster_ids(conversation_id).await?;
        self.presence.publish(&recipients, &frame).await;
        self.audit.record(AuditEvent::new(
            caller,
            "participant.add",
            "conversation",
            conversation_id,
        ));
        Ok(())
    }

    pub async fn remove_participant(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        let caller_row = self.require_participant(conversation_id, caller).await?;
        if caller != user_id && caller_row.role != ParticipantRole::Moderator {
            return Err(AppError::NotOwner);
        }

        if !self
            .conversations
            .remove_participant(conversation_id, user_id)
            .await?
        {
            return Err(AppError::NotFound);
        }

        let remaining = self.conversations.participants(conversation_id).await?;
        let frame = PushFrame::participant_left(conversation_id, user_id);
        let recipients: Vec<Uuid> = remaining.iter().map(|p| p.user_id).collect();
        self.presence.publish(&recipients, &frame).await;

        if remaining.is_empty() && conversation.is_open() {
            self.conversations
                .update_status(
                    conversation_id,
                    ConversationStatus::Closed,
                    Some(CloseReason::LastParticipantLeft),
                )
                .await?;
            tracing::info!(%conversation_id, "conversation closed, last participant left");
        }

        self.audit.record(AuditEvent::new(
            caller,
            "participant.remove",
            "conversation",
            conversation_id,
        ));
        Ok(())
    }

    pub async fn set_participant_muted(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        muted: bool,
    ) -> AppResult<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Self::require_open(&conversation)?;
        self.require_moderator(conversation_id, caller).await?;

        self.conversations
            .set_participant_muted(conversation_id, user_id, muted)
            .await?;
        self.audit.record(AuditEvent::new(
            caller,
            if muted { "participant.mute" } else { "participant.unmute" },
            "conversation",
            conversation_id,
        ));
        Ok(())
    }

    /// Administrator-only kill switch silencing the whole conversation.
    pub async fn set_system_muted(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        muted: bool,
    ) -> AppResult<()> {
        if !self.identity.has_role(caller, ADMINISTRATOR_ROLE).await? {
            return Err(AppError::NotOwner);
        }
        let _guard = self.locks.acquire(conversation_id).await;
        self.conversations
            .update_system_muted(conversation_id, muted)
            .await?;
        self.audit.record(AuditEvent::new(
            caller,
            if muted { "conversation.mute" } else { "conversation.unmute" },
            "conversation",
            conversation_id,
        ));
        Ok(())
    }

    pub async fn send_message(
        &self,
        sender: Uuid,
        conversation_id: Uuid,
        plaintext: &str,
    ) -> AppResult<Message> {
        if plaintext.is_empty() {
            return Err(AppError::BadRequest("message body must not be empty".into()));
        }
        // Status and roster are checked under the lock so a racing close or
        // removal cannot slip a message into a closed conversation.
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Self::require_open(&conversation)?;
        let sender_row = self.require_participant(conversation_id, sender).await?;
        if sender_row.muted || conversation.system_muted {
            return Err(AppError::ParticipantMuted);
        }
        self.limiter.check_and_record(sender, conversation_id).await?;

        let ciphertext = self.keys.encrypt(conversation_id, plaintext.as_bytes()).await?;
        let message = self
            .messages
            .append(conversation_id, sender, ciphertext)
            .await?;
        self.conversations
            .touch_activity(conversation_id, message.created_at)
            .await?;

        let recipients: Vec<Uuid> = self
            .roster_ids(conversation_id)
            .await?
            .into_iter()
            .filter(|&u| u != sender)
            .collect();

        let frame = PushFrame::message_created(&message);
        let missed = self.presence.publish(&recipients, &frame).await;

        let reached: Vec<Uuid> = recipients
            .iter()
            .copied()
            .filter(|u| !missed.contains(u))
            .collect();
        self.messages
            .upsert_receipts(message.id, &reached, DeliveryStatus::Delivered)
            .await?;
        self.messages
            .upsert_receipts(message.id, &missed, DeliveryStatus::Sent)
            .await?;

        self.dispatcher.notify_missed(&message, &missed).await;

        self.audit.record(AuditEvent::new(
            sender,
            "message.send",
            "message",
            message.id,
        ));
        Ok(message)
    }

    pub async fn get_messages(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<MessageView>> {
        self.require_participant(conversation_id, caller).await?;
        let limit = limit.clamp(1, 500);
        let stored = self
            .messages
            .list_since(conversation_id, since_seq, limit)
            .await?;

        let mut out = Vec::with_capacity(stored.len());
        for message in stored {
            let plaintext = if message.deleted {
                None
            } else {
                let bytes = self.keys.decrypt(conversation_id, &message.ciphertext).await?;
                Some(String::from_utf8(bytes).map_err(|_| AppError::Internal)?)
            };
            out.push(MessageView {
                id: message.id,
                sender_id: message.sender_id,
                sequence_number: message.sequence_number,
                plaintext,
                created_at: message.created_at,
                edited_at: message.edited_at,
                deleted: message.deleted,
            });
        }
        Ok(out)
    }

    pub async fn edit_message(
        &self,
        editor: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        new_plaintext: &str,
    ) -> AppResult<()> {
        if new_plaintext.is_empty() {
            return Err(AppError::BadRequest("message body must not be empty".into()));
        }
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Self::require_open(&conversation)?;
        self.require_participant(conversation_id, editor).await?;

        let message = self.messages.get(message_id).await?;
        if message.conversation_id != conversation_id || message.deleted {
            return Err(AppError::NotFound);
        }
        if message.sender_id != editor {
            return Err(AppError::NotOwner);
        }
        let age = Utc::now() - message.created_at;
        if age > self.edit_window {
            return Err(AppError::EditWindowExpired {
                max_edit_minutes: self.edit_window.num_minutes(),
            });
        }
        self.limiter.check_and_record(editor, conversation_id).await?;

        let ciphertext = self.keys.encrypt(conversation_id, new_plaintext.as_bytes()).await?;
        let edited_at = Utc::now();
        self.messages
            .update_ciphertext(message_id, ciphertext.clone(), edited_at)
            .await?;
        self.conversations
            .touch_activity(conversation_id, edited_at)
            .await?;

        let mut edited = message;
        edited.ciphertext = ciphertext;
        edited.edited_at = Some(edited_at);
        let recipients = self.roster_ids(conversation_id).await?;
        self.presence
            .publish(&recipients, &PushFrame::message_edited(&edited))
            .await;

        self.audit.record(AuditEvent::new(
            editor,
            "message.edit",
            "message",
            message_id,
        ));
        Ok(())
    }

    pub async fn delete_message(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Self::require_open(&conversation)?;
        let caller_row = self.require_participant(conversation_id, caller).await?;

        let message = self.messages.get(message_id).await?;
        if message.conversation_id != conversation_id || message.deleted {
            return Err(AppError::NotFound);
        }
        if message.sender_id != caller && caller_row.role != ParticipantRole::Moderator {
            return Err(AppError::NotOwner);
        }

        self.messages.tombstone(message_id).await?;
        self.audit.record(AuditEvent::new(
            caller,
            "message.delete",
            "message",
            message_id,
        ));
        Ok(())
    }

    pub async fn close_conversation(&self, caller: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        self.require_manager(conversation_id, caller).await?;
        match conversation.status {
            ConversationStatus::Open => {}
            ConversationStatus::Closed => return Ok(()), // idempotent
            ConversationStatus::Archived => return Err(AppError::ConversationClosed),
        }
        self.conversations
            .update_status(
                conversation_id,
                ConversationStatus::Closed,
                Some(CloseReason::ModeratorRequest),
            )
            .await?;
        self.audit.record(AuditEvent::new(
            caller,
            "conversation.close",
            "conversation",
            conversation_id,
        ));
        Ok(())
    }

    pub async fn archive_conversation(&self, caller: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        self.require_manager(conversation_id, caller).await?;
        match conversation.status {
            ConversationStatus::Closed => {}
            ConversationStatus::Archived => return Ok(()), // idempotent
            ConversationStatus::Open => {
                return Err(AppError::BadRequest(
                    "conversation must be closed before archiving".into(),
                ))
            }
        }
        self.conversations
            .update_status(conversation_id, ConversationStatus::Archived, None)
            .await?;
        self.audit.record(AuditEvent::new(
            caller,
            "conversation.archive",
            "conversation",
            conversation_id,
        ));
        Ok(())
    }

    pub async fn mark_read(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<()> {
        self.require_participant(conversation_id, caller).await?;
        self.conversations
            .set_last_read_seq(conversation_id, caller, up_to_seq)
            .await?;
        self.messages
            .mark_read_up_to(conversation_id, caller, up_to_seq)
            .await?;

        let recipients: Vec<Uuid> = self
            .roster_ids(conversation_id)
            .await?
            .into_iter()
            .filter(|&u| u != caller)
            .collect();
        self.presence
            .publish(
                &recipients,
                &PushFrame::read_receipt(conversation_id, caller, up_to_seq),
            )
            .await;
        Ok(())
    }

    pub async fn typing(&self, caller: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let conversation = self.conversations.get_conversation(conversation_id).await?;
        Self::require_open(&conversation)?;
        self.require_participant(conversation_id, caller).await?;

        let recipients: Vec<Uuid> = self
            .roster_ids(conversation_id)
            .await?
            .into_iter()
            .filter(|&u| u != caller)
            .collect();
        self.presence
            .publish(&recipients, &PushFrame::typing(conversation_id, caller))
            .await;
        Ok(())
    }

    /// Tell the rosters this user shares a conversation with that their
    /// presence flipped.
    pub async fn broadcast_presence(&self, user_id: Uuid, online: bool) -> AppResult<()> {
        for conversation in self.conversations.list_for_user(user_id).await? {
            let recipients: Vec<Uuid> = self
                .roster_ids(conversation.id)
                .await?
                .into_iter()
                .filter(|&u| u != user_id)
                .collect();
            self.presence
                .publish(
                    &recipients,
                    &PushFrame::presence_changed(conversation.id, user_id, online),
                )
                .await;
        }
        Ok(())
    }

    /// Opportunistic cleanup of idle per-conversation lock entries.
    pub async fn evict_idle_locks(&self) {
        self.locks.evict_idle().await;
    }
}
