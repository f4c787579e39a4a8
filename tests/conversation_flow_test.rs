//! End-to-end flows against the in-memory backends: full message lifecycle,
//! roster bounds, mute enforcement, edit windows, rate limits, and offline
//! notification behavior, all through the public service API.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conversation_service::audit::{AuditTrail, MemoryAuditSink};
use conversation_service::collaborators::{
    AllowAllIdentity, IdentityResolver, MemoryNotificationSink, NotificationPayload,
    ADMINISTRATOR_ROLE,
};
use conversation_service::config::RateLimitConfig;
use conversation_service::error::{AppError, AppResult};
use conversation_service::models::{
    CloseReason, ContextRef, Conversation, ConversationStatus, ConversationType, Participant,
    ParticipantRole,
};
use conversation_service::presence::PresenceRegistry;
use conversation_service::services::conversation_service::{
    ConversationOptions, ConversationPolicy, ConversationService,
};
use conversation_service::services::key_manager::KeyManager;
use conversation_service::services::notification_dispatcher::NotificationDispatcher;
use conversation_service::services::rate_limiter::{MemoryCounterStore, RateLimiter};
use conversation_service::store::memory::MemoryStore;
use conversation_service::store::{ConversationStore, MessageStore};
use crypto_core::KdfParams;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

struct Harness {
    service: ConversationService,
    presence: PresenceRegistry,
    dispatcher: NotificationDispatcher,
    sink: Arc<MemoryNotificationSink>,
    store: Arc<MemoryStore>,
    keys: Arc<KeyManager>,
}

fn policy() -> ConversationPolicy {
    ConversationPolicy {
        max_participants: 50,
        edit_window_minutes: 15,
        default_retention_days: 730,
        max_retention_days: 3650,
        default_auto_close_days: 90,
        max_auto_close_days: 365,
    }
}

fn test_keys() -> Arc<KeyManager> {
    Arc::new(KeyManager::new(
        b"integration test secret, 32 bytes ok".to_vec(),
        KdfParams {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        },
    ))
}

fn harness() -> Harness {
    harness_with(
        RateLimitConfig {
            user_max_per_window: 30,
            conversation_max_per_window: 100,
            window_secs: 60,
        },
        Arc::new(AllowAllIdentity),
    )
}

fn harness_with(limits: RateLimitConfig, identity: Arc<dyn IdentityResolver>) -> Harness {
    let store = MemoryStore::new();
    let keys = test_keys();
    let presence = PresenceRegistry::new(Duration::from_secs(120));
    let sink = MemoryNotificationSink::new();
    let dispatcher = NotificationDispatcher::new(
        Duration::from_secs(30),
        presence.clone(),
        sink.clone(),
    );
    let service = ConversationService::new(
        store.clone(),
        store.clone(),
        keys.clone(),
        Arc::new(RateLimiter::new(MemoryCounterStore::new(), limits)),
        presence.clone(),
        dispatcher.clone(),
        identity,
        AuditTrail::spawn(MemoryAuditSink::new()),
        policy(),
    );
    Harness {
        service,
        presence,
        dispatcher,
        sink,
        store,
        keys,
    }
}

async fn open_group(h: &Harness, creator: Uuid, topic: &str) -> Conversation {
    h.service
        .create_conversation(
            creator,
            Uuid::new_v4(),
            ConversationType::Group,
            None,
            topic.into(),
            ConversationOptions::default(),
        )
        .await
        .unwrap()
}

async fn add_member(h: &Harness, caller: Uuid, conversation_id: Uuid, user: Uuid) {
    h.service
        .add_participant(caller, conversation_id, user, ParticipantRole::Member)
        .await
        .unwrap();
}

#[tokio::test]
async fn online_recipient_gets_the_event_and_history_decrypts() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let conversation = open_group(&h, alice, "standup").await;
    add_member(&h, alice, conversation.id, bob).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.presence.connect(bob, tx).await;

    let sent = h
        .service
        .send_message(alice, conversation.id, "hello bob")
        .await
        .unwrap();
    assert_eq!(sent.sequence_number, 1);

    // bob's socket sees the ciphertext, never the plaintext
    let frame = rx.recv().await.unwrap();
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["event_type"], "message_created");
    assert_eq!(value["payload"]["sequence_number"], 1);
    let pushed = STANDARD
        .decode(value["payload"]["ciphertext"].as_str().unwrap())
        .unwrap();
    assert_ne!(pushed, b"hello bob");

    // the pushed blob matches the stored one and is opaque without the key
    let raw = h.store.get(sent.id).await.unwrap();
    assert_eq!(pushed, raw.ciphertext);
    assert!(raw.ciphertext.len() > b"hello bob".len());

    // history decrypts for a participant
    let views = h
        .service
        .get_messages(bob, conversation.id, 0, 50)
        .await
        .unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].plaintext.as_deref(), Some("hello bob"));
}

#[tokio::test]
async fn contextual_conversations_require_a_context() {
    let h = harness();
    let alice = Uuid::new_v4();

    let err = h
        .service
        .create_conversation(
            alice,
            Uuid::new_v4(),
            ConversationType::Contextual,
            None,
            "order dispute".into(),
            ConversationOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidType));

    let context = ContextRef {
        context_type: "order".into(),
        context_id: Uuid::new_v4(),
    };
    let conversation = h
        .service
        .create_conversation(
            alice,
            Uuid::new_v4(),
            ConversationType::Contextual,
            Some(context.clone()),
            "order dispute".into(),
            ConversationOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(conversation.context, Some(context));

    // a context on a plain group is rejected too
    assert!(matches!(
        h.service
            .create_conversation(
                alice,
                Uuid::new_v4(),
                ConversationType::Group,
                Some(ContextRef {
                    context_type: "order".into(),
                    context_id: Uuid::new_v4(),
                }),
                "chatter".into(),
                ConversationOptions::default(),
            )
            .await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn retention_and_auto_close_overrides_are_bounded() {
    let h = harness();
    let alice = Uuid::new_v4();

    for bad_retention in [-10000, 0, 3651] {
        let err = h
            .service
            .create_conversation(
                alice,
                Uuid::new_v4(),
                ConversationType::Group,
                None,
                "bounds".into(),
                ConversationOptions {
                    retention_days: Some(bad_retention),
                    ..ConversationOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)), "{bad_retention}");
    }

    for bad_auto_close in [-1, 0, 366] {
        let err = h
            .service
            .create_conversation(
                alice,
                Uuid::new_v4(),
                ConversationType::Group,
                None,
                "bounds".into(),
                ConversationOptions {
                    auto_close_days: Some(bad_auto_close),
                    ..ConversationOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)), "{bad_auto_close}");
    }

    let conversation = h
        .service
        .create_conversation(
            alice,
            Uuid::new_v4(),
            ConversationType::Group,
            None,
            "bounds".into(),
            ConversationOptions {
                retention_days: Some(30),
                auto_close_days: Some(14),
                ..ConversationOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(conversation.retention_days, 30);
    assert_eq!(conversation.auto_close_days, 14);
}

#[tokio::test]
async fn direct_conversations_hold_exactly_two_people() {
    let h = harness();
    let alice = Uuid::new_v4();
    let conversation = h
        .service
        .create_conversation(
            alice,
            Uuid::new_v4(),
            ConversationType::Direct,
            None,
            "dm".into(),
            ConversationOptions {
                // the requested cap is ignored for direct conversations
                max_participants: Some(10),
                ..ConversationOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(conversation.max_participants, 2);

    add_member(&h, alice, conversation.id, Uuid::new_v4()).await;
    assert!(matches!(
        h.service
            .add_participant(
                alice,
                conversation.id,
                Uuid::new_v4(),
                ParticipantRole::Member
            )
            .await,
        Err(AppError::RosterFull)
    ));
}

#[tokio::test]
async fn non_participant_is_rejected_everywhere() {
    let h = harness();
    let alice = Uuid::new_v4();
    let eve = Uuid::new_v4();
    let conversation = open_group(&h, alice, "private").await;

    assert!(matches!(
        h.service.send_message(eve, conversation.id, "hi").await,
        Err(AppError::NotAParticipant)
    ));
    assert!(matches!(
        h.service.get_messages(eve, conversation.id, 0, 50).await,
        Err(AppError::NotAParticipant)
    ));
    assert!(matches!(
        h.service
            .add_participant(eve, conversation.id, Uuid::new_v4(), ParticipantRole::Member)
            .await,
        Err(AppError::NotAParticipant)
    ));
}

#[tokio::test]
async fn roster_never_exceeds_the_cap_under_random_churn() {
    let h = harness();
    let moderator = Uuid::new_v4();
    let conversation = open_group(&h, moderator, "crowd").await;

    let mut members: Vec<Uuid> = Vec::new();
    let mut seed: u64 = 0x2545F4914F6CDD1D;
    for _ in 0..600 {
        // xorshift, deterministic churn
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;

        if seed % 3 == 0 && !members.is_empty() {
            let victim = members.remove((seed as usize / 7) % members.len());
            h.service
                .remove_participant(moderator, conversation.id, victim)
                .await
                .unwrap();
        } else {
            let user = Uuid::new_v4();
            match h
                .service
                .add_participant(moderator, conversation.id, user, ParticipantRole::Member)
                .await
            {
                Ok(()) => members.push(user),
                Err(AppError::RosterFull) => {
                    assert_eq!(members.len(), 49); // 49 members + moderator
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let roster = h.store.participants(conversation.id).await.unwrap();
        assert!(roster.len() <= 50);
    }
}

#[tokio::test]
async fn re_adding_a_participant_is_a_no_op() {
    let h = harness();
    let moderator = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, moderator, "dup").await;

    add_member(&h, moderator, conversation.id, bob).await;
    add_member(&h, moderator, conversation.id, bob).await;

    assert_eq!(h.store.participants(conversation.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn last_participant_leaving_closes_the_conversation() {
    let h = harness();
    let moderator = Uuid::new_v4();
    let conversation = open_group(&h, moderator, "ghost town").await;

    h.service
        .remove_participant(moderator, conversation.id, moderator)
        .await
        .unwrap();

    let closed = h.store.get_conversation(conversation.id).await.unwrap();
    assert_eq!(closed.status, ConversationStatus::Closed);
    assert_eq!(closed.close_reason, Some(CloseReason::LastParticipantLeft));
}

#[tokio::test]
async fn closed_conversation_rejects_writes_but_serves_history() {
    let h = harness();
    let moderator = Uuid::new_v4();
    let conversation = open_group(&h, moderator, "done").await;
    h.service
        .send_message(moderator, conversation.id, "last words")
        .await
        .unwrap();
    h.service
        .close_conversation(moderator, conversation.id)
        .await
        .unwrap();

    assert!(matches!(
        h.service.send_message(moderator, conversation.id, "more").await,
        Err(AppError::ConversationClosed)
    ));

    let views = h
        .service
        .get_messages(moderator, conversation.id, 0, 50)
        .await
        .unwrap();
    assert_eq!(views[0].plaintext.as_deref(), Some("last words"));
}

#[tokio::test]
async fn archive_requires_closed_and_is_terminal() {
    let h = harness();
    let moderator = Uuid::new_v4();
    let conversation = open_group(&h, moderator, "records").await;

    assert!(matches!(
        h.service
            .archive_conversation(moderator, conversation.id)
            .await,
        Err(AppError::BadRequest(_))
    ));

    h.service
        .close_conversation(moderator, conversation.id)
        .await
        .unwrap();
    h.service
        .archive_conversation(moderator, conversation.id)
        .await
        .unwrap();
    // idempotent
    h.service
        .archive_conversation(moderator, conversation.id)
        .await
        .unwrap();

    let archived = h.store.get_conversation(conversation.id).await.unwrap();
    assert_eq!(archived.status, ConversationStatus::Archived);

    // archived conversations drop out of active listings
    assert!(h
        .service
        .list_conversations(moderator)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn only_the_sender_may_edit_within_the_window() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, alice, "edits").await;
    add_member(&h, alice, conversation.id, bob).await;

    let message = h
        .service
        .send_message(alice, conversation.id, "teh typo")
        .await
        .unwrap();

    assert!(matches!(
        h.service
            .edit_message(bob, conversation.id, message.id, "hijack")
            .await,
        Err(AppError::NotOwner)
    ));

    h.service
        .edit_message(alice, conversation.id, message.id, "the typo, fixed")
        .await
        .unwrap();

    let views = h
        .service
        .get_messages(bob, conversation.id, 0, 50)
        .await
        .unwrap();
    assert_eq!(views[0].plaintext.as_deref(), Some("the typo, fixed"));
    assert!(views[0].edited_at.is_some());
}

#[tokio::test]
async fn edit_window_boundary_is_exact() {
    let h = harness();
    let alice = Uuid::new_v4();
    let conversation = open_group(&h, alice, "deadline").await;

    // one second inside the 15 minute window still edits
    let inside = h
        .service
        .send_message(alice, conversation.id, "almost late")
        .await
        .unwrap();
    h.store
        .backdate_message(inside.id, Utc::now() - ChronoDuration::seconds(15 * 60 - 1))
        .await
        .unwrap();
    h.service
        .edit_message(alice, conversation.id, inside.id, "made it")
        .await
        .unwrap();

    // one second past the window is refused
    let outside = h
        .service
        .send_message(alice, conversation.id, "too late")
        .await
        .unwrap();
    h.store
        .backdate_message(outside.id, Utc::now() - ChronoDuration::seconds(15 * 60 + 1))
        .await
        .unwrap();
    match h
        .service
        .edit_message(alice, conversation.id, outside.id, "nope")
        .await
    {
        Err(AppError::EditWindowExpired { max_edit_minutes }) => {
            assert_eq!(max_edit_minutes, 15);
        }
        other => panic!("expected EditWindowExpired, got {other:?}"),
    }
}

#[tokio::test]
async fn thirty_first_send_in_a_minute_is_rate_limited() {
    let h = harness();
    let alice = Uuid::new_v4();
    let conversation = open_group(&h, alice, "burst").await;

    for i in 0..30 {
        h.service
            .send_message(alice, conversation.id, &format!("msg {i}"))
            .await
            .unwrap();
    }
    match h
        .service
        .send_message(alice, conversation.id, "one too many")
        .await
    {
        Err(AppError::RateLimited { retry_after_secs }) => assert!(retry_after_secs >= 1),
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn tombstoned_message_keeps_its_slot() {
    let h = harness();
    let alice = Uuid::new_v4();
    let conversation = open_group(&h, alice, "gaps").await;

    let first = h
        .service
        .send_message(alice, conversation.id, "one")
        .await
        .unwrap();
    h.service.send_message(alice, conversation.id, "two").await.unwrap();
    h.service
        .delete_message(alice, conversation.id, first.id)
        .await
        .unwrap();

    let views = h
        .service
        .get_messages(alice, conversation.id, 0, 50)
        .await
        .unwrap();
    assert_eq!(views.len(), 2);
    assert!(views[0].deleted);
    assert_eq!(views[0].plaintext, None);
    assert_eq!(views[0].sequence_number, 1);
    assert_eq!(views[1].sequence_number, 2);
}

#[tokio::test]
async fn muted_participant_reads_but_cannot_send() {
    let h = harness();
    let moderator = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, moderator, "quiet corner").await;
    add_member(&h, moderator, conversation.id, bob).await;
    h.service
        .send_message(moderator, conversation.id, "ground rules")
        .await
        .unwrap();

    // a member cannot mute
    assert!(matches!(
        h.service
            .set_participant_muted(bob, conversation.id, moderator, true)
            .await,
        Err(AppError::NotOwner)
    ));

    h.service
        .set_participant_muted(moderator, conversation.id, bob, true)
        .await
        .unwrap();
    assert!(matches!(
        h.service.send_message(bob, conversation.id, "but").await,
        Err(AppError::ParticipantMuted)
    ));

    // reading is unaffected
    let views = h
        .service
        .get_messages(bob, conversation.id, 0, 50)
        .await
        .unwrap();
    assert_eq!(views.len(), 1);

    h.service
        .set_participant_muted(moderator, conversation.id, bob, false)
        .await
        .unwrap();
    h.service.send_message(bob, conversation.id, "back").await.unwrap();
}

/// Grants the administrator role to one fixed user, nothing to anyone else.
struct SingleAdmin {
    admin: Uuid,
}

#[async_trait]
impl IdentityResolver for SingleAdmin {
    async fn is_member(&self, _user_id: Uuid, _tenant_id: Uuid) -> AppResult<bool> {
        Ok(true)
    }

    async fn has_role(&self, user_id: Uuid, role: &str) -> AppResult<bool> {
        Ok(user_id == self.admin && role == ADMINISTRATOR_ROLE)
    }

    async fn within_open_conversation_cap(&self, _user_id: Uuid) -> AppResult<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn administrator_can_close_and_system_mute_from_outside_the_roster() {
    let admin = Uuid::new_v4();
    let h = harness_with(
        RateLimitConfig {
            user_max_per_window: 30,
            conversation_max_per_window: 100,
            window_secs: 60,
        },
        Arc::new(SingleAdmin { admin }),
    );
    let alice = Uuid::new_v4();
    let eve = Uuid::new_v4();
    let conversation = open_group(&h, alice, "escalated").await;

    // system mute silences every participant, even unmuted ones
    assert!(matches!(
        h.service.set_system_muted(eve, conversation.id, true).await,
        Err(AppError::NotOwner)
    ));
    h.service
        .set_system_muted(admin, conversation.id, true)
        .await
        .unwrap();
    assert!(matches!(
        h.service.send_message(alice, conversation.id, "hello?").await,
        Err(AppError::ParticipantMuted)
    ));
    h.service
        .set_system_muted(admin, conversation.id, false)
        .await
        .unwrap();
    h.service
        .send_message(alice, conversation.id, "back on")
        .await
        .unwrap();

    // a plain outsider cannot close; the administrator can
    assert!(matches!(
        h.service.close_conversation(eve, conversation.id).await,
        Err(AppError::NotOwner)
    ));
    h.service.close_conversation(admin, conversation.id).await.unwrap();
    let closed = h.store.get_conversation(conversation.id).await.unwrap();
    assert_eq!(closed.status, ConversationStatus::Closed);
}

#[tokio::test]
async fn mark_read_updates_unread_counts_and_notifies_roster() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, alice, "receipts").await;
    add_member(&h, alice, conversation.id, bob).await;

    h.service.send_message(alice, conversation.id, "one").await.unwrap();
    h.service.send_message(alice, conversation.id, "two").await.unwrap();

    let before = h.service.list_conversations(bob).await.unwrap();
    assert_eq!(before[0].unread, 2);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.presence.connect(alice, tx).await;
    h.service.mark_read(bob, conversation.id, 2).await.unwrap();

    let after = h.service.list_conversations(bob).await.unwrap();
    assert_eq!(after[0].unread, 0);

    let frame = rx.recv().await.unwrap();
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["event_type"], "read_receipt");
    assert_eq!(value["payload"]["up_to_seq"], 2);
}

#[tokio::test(start_paused = true)]
async fn offline_recipient_gets_exactly_one_notification() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, alice, "offline").await;
    add_member(&h, alice, conversation.id, bob).await;

    h.service
        .send_message(alice, conversation.id, "you there?")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.sink.count_for(bob).await, 1);

    let delivered = h.sink.drain().await;
    match &delivered[0].1 {
        NotificationPayload::OfflineMessage {
            conversation_id, ..
        } => assert_eq!(*conversation_id, conversation.id),
        other => panic!("expected offline message, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_within_the_delay_suppresses_the_notification() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, alice, "close call").await;
    add_member(&h, alice, conversation.id, bob).await;

    h.service
        .send_message(alice, conversation.id, "you there?")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.presence.connect(bob, tx).await;
    h.dispatcher.on_reconnect(bob).await;

    // the missed event is re-delivered live instead
    let frame = rx.recv().await.unwrap();
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["event_type"], "message_created");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.sink.count_for(bob).await, 0);
}

#[tokio::test]
async fn moderator_role_is_enforced_for_roster_and_lifecycle() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, alice, "hierarchy").await;
    add_member(&h, alice, conversation.id, bob).await;

    assert!(matches!(
        h.service
            .add_participant(bob, conversation.id, Uuid::new_v4(), ParticipantRole::Member)
            .await,
        Err(AppError::NotOwner)
    ));
    assert!(matches!(
        h.service
            .remove_participant(bob, conversation.id, alice)
            .await,
        Err(AppError::NotOwner)
    ));
    assert!(matches!(
        h.service.close_conversation(bob, conversation.id).await,
        Err(AppError::NotOwner)
    ));

    // a second moderator gets the same powers
    let carol = Uuid::new_v4();
    h.service
        .add_participant(alice, conversation.id, carol, ParticipantRole::Moderator)
        .await
        .unwrap();
    h.service.close_conversation(carol, conversation.id).await.unwrap();
    let closed = h.store.get_conversation(conversation.id).await.unwrap();
    assert_eq!(closed.close_reason, Some(CloseReason::ModeratorRequest));
}

#[tokio::test]
async fn members_may_always_leave_on_their_own() {
    let h = harness();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conversation = open_group(&h, alice, "exit").await;
    add_member(&h, alice, conversation.id, bob).await;

    h.service
        .remove_participant(bob, conversation.id, bob)
        .await
        .unwrap();
    assert_eq!(h.store.participants(conversation.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn key_destruction_orphans_stored_ciphertext() {
    let h = harness();
    let alice = Uuid::new_v4();
    let conversation = open_group(&h, alice, "doomed").await;
    h.service
        .send_message(alice, conversation.id, "secret")
        .await
        .unwrap();

    h.keys.destroy_key(conversation.id).await;

    assert!(matches!(
        h.service.get_messages(alice, conversation.id, 0, 50).await,
        Err(AppError::KeyNotFound)
    ));
}

/// Store whose inserts always fail, recording the id it rejected.
struct RejectingStore {
    inner: Arc<MemoryStore>,
    rejected: tokio::sync::Mutex<Option<Uuid>>,
}

#[async_trait]
impl ConversationStore for RejectingStore {
    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        _owner: &Participant,
    ) -> AppResult<()> {
        *self.rejected.lock().await = Some(conversation.id);
        Err(AppError::Database("insert refused".into()))
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation> {
        self.inner.get_conversation(id).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
        reason: Option<CloseReason>,
    ) -> AppResult<()> {
        self.inner.update_status(id, status, reason).await
    }

    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.inner.touch_activity(id, at).await
    }

    async fn add_participant(&self, participant: &Participant) -> AppResult<bool> {
        self.inner.add_participant(participant).await
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        self.inner.remove_participant(conversation_id, user_id).await
    }

    async fn set_participant_muted(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted: bool,
    ) -> AppResult<()> {
        self.inner
            .set_participant_muted(conversation_id, user_id, muted)
            .await
    }

    async fn update_system_muted(&self, id: Uuid, muted: bool) -> AppResult<()> {
        self.inner.update_system_muted(id, muted).await
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        self.inner.participants(conversation_id).await
    }

    async fn participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        self.inner.participant(conversation_id, user_id).await
    }

    async fn set_last_read_seq(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        seq: i64,
    ) -> AppResult<()> {
        self.inner
            .set_last_read_seq(conversation_id, user_id, seq)
            .await
    }

    async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        self.inner.list_for_user(user_id).await
    }

    async fn list_all(&self) -> AppResult<Vec<Conversation>> {
        self.inner.list_all().await
    }

    async fn purge_conversation(&self, id: Uuid) -> AppResult<()> {
        self.inner.purge_conversation(id).await
    }
}

#[tokio::test]
async fn failed_conversation_insert_does_not_leak_a_cached_key() {
    let memory = MemoryStore::new();
    let rejecting = Arc::new(RejectingStore {
        inner: memory.clone(),
        rejected: tokio::sync::Mutex::new(None),
    });
    let keys = test_keys();
    let presence = PresenceRegistry::new(Duration::from_secs(120));
    let sink = MemoryNotificationSink::new();
    let service = ConversationService::new(
        rejecting.clone(),
        memory,
        keys.clone(),
        Arc::new(RateLimiter::new(
            MemoryCounterStore::new(),
            RateLimitConfig {
                user_max_per_window: 30,
                conversation_max_per_window: 100,
                window_secs: 60,
            },
        )),
        presence.clone(),
        NotificationDispatcher::new(Duration::from_secs(30), presence, sink),
        Arc::new(AllowAllIdentity),
        AuditTrail::spawn(MemoryAuditSink::new()),
        policy(),
    );

    let err = service
        .create_conversation(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ConversationType::Group,
            None,
            "doomed".into(),
            ConversationOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Database(_)));

    let rejected = rejecting.rejected.lock().await.take().unwrap();
    assert!(!keys.has_key(rejected).await);
}
