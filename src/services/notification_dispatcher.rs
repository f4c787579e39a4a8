//! Offline notification flow. A recipient missed by live fan-out gets a
//! grace window to reconnect; only when the window lapses while they are
//! still offline does a notification reach the delivery collaborator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

use crate::collaborators::{NotificationPayload, NotificationSink};
use crate::error::AppResult;
use crate::models::Message;
use crate::presence::PresenceRegistry;
use crate::store::{ConversationStore, MessageStore};
use crate::websocket::events::PushFrame;

/// (user, conversation) pairs individually notified since the last digest
/// run. The digest skips them so one burst does not alert twice.
#[derive(Default, Clone)]
pub struct NotifiedMarkers {
    inner: Arc<Mutex<HashSet<(Uuid, Uuid)>>>,
}

impl NotifiedMarkers {
    pub async fn mark(&self, user_id: Uuid, conversation_id: Uuid) {
        self.inner.lock().await.insert((user_id, conversation_id));
    }

    pub async fn take(&self) -> HashSet<(Uuid, Uuid)> {
        std::mem::take(&mut *self.inner.lock().await)
    }
}

struct PendingNotice {
    conversation_id: Uuid,
    frame: PushFrame,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    delay: Duration,
    presence: PresenceRegistry,
    sink: Arc<dyn NotificationSink>,
    markers: NotifiedMarkers,
    /// user -> notice id -> pending delayed notification
    pending: Arc<Mutex<HashMap<Uuid, HashMap<Uuid, PendingNotice>>>>,
}

impl NotificationDispatcher {
    pub fn new(delay: Duration, presence: PresenceRegistry, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            delay,
            presence,
            sink,
            markers: NotifiedMarkers::default(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn markers(&self) -> NotifiedMarkers {
        self.markers.clone()
    }

    /// Schedule a delayed notification for each recipient the live fan-out
    /// missed.
    pub async fn notify_missed(&self, message: &Message, missed: &[Uuid]) {
        for &user_id in missed {
            let notice_id = Uuid::new_v4();
            let frame = PushFrame::message_created(message);
            let dispatcher = self.clone();
            let message_id = message.id;
            let conversation_id = message.conversation_id;
            let sender_id = message.sender_id;

            let handle = tokio::spawn({
                let dispatcher = dispatcher.clone();
                async move {
                    tokio::time::sleep(dispatcher.delay).await;

                    // A cancelled notice has already been removed.
                    let notice = {
                        let mut pending = dispatcher.pending.lock().await;
                        let Some(per_user) = pending.get_mut(&user_id) else { return };
                        per_user.remove(&notice_id)
                    };
                    let Some(notice) = notice else { return };

                    // Reconnected without touching the pending map: deliver
                    // live instead of alerting.
                    if dispatcher.presence.is_online(user_id).await {
                        dispatcher.presence.publish(&[user_id], &notice.frame).await;
                        return;
                    }

                    let payload = NotificationPayload::OfflineMessage {
                        conversation_id,
                        message_id,
                        sender_id,
                    };
                    if let Err(e) = dispatcher.sink.enqueue_notification(user_id, payload).await {
                        tracing::error!(error = %e, %user_id, "offline notification enqueue failed");
                        return;
                    }
                    dispatcher.markers.mark(user_id, conversation_id).await;
                }
            });

            self.pending.lock().await.entry(user_id).or_default().insert(
                notice_id,
                PendingNotice {
                    conversation_id,
                    frame,
                    handle,
                },
            );
        }
    }

    /// Cancel the user's pending notices and re-deliver their frames live.
    /// Called when a session for the user connects.
    pub async fn on_reconnect(&self, user_id: Uuid) {
        let notices: Vec<PendingNotice> = {
            let mut pending = self.pending.lock().await;
            pending
                .remove(&user_id)
                .map(|per_user| per_user.into_values().collect())
                .unwrap_or_default()
        };
        for notice in notices {
            notice.handle.abort();
            tracing::debug!(%user_id, conversation_id = %notice.conversation_id,
                "pending offline notification cancelled on reconnect");
            self.presence.publish(&[user_id], &notice.frame).await;
        }
    }

    /// One digest pass: unread counts per (participant, conversation), minus
    /// the pairs that already got an individual notification this cycle.
    pub async fn run_digest_once(
        &self,
        conversations: &dyn ConversationStore,
        messages: &dyn MessageStore,
    ) -> AppResult<usize> {
        let skip = self.markers.take().await;
        let mut per_user: HashMap<Uuid, HashMap<Uuid, i64>> = HashMap::new();

        for conversation in conversations.list_all().await? {
            for participant in conversations.participants(conversation.id).await? {
                if skip.contains(&(participant.user_id, conversation.id)) {
                    continue;
                }
                let unread = messages
                    .unread_count(conversation.id, participant.last_read_seq)
                    .await?;
                if unread > 0 {
                    per_user
                        .entry(participant.user_id)
                        .or_default()
                        .insert(conversation.id, unread);
                }
            }
        }

        let digests = per_user.len();
        for (user_id, unread) in per_user {
            let payload = NotificationPayload::Digest {
                unread,
                generated_at: chrono::Utc::now(),
            };
            if let Err(e) = self.sink.enqueue_notification(user_id, payload).await {
                tracing::error!(error = %e, %user_id, "digest enqueue failed");
            }
        }
        Ok(digests)
    }

    /// Periodic digest loop, spawned at startup.
    pub fn spawn_digest(
        &self,
        interval: Duration,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                match dispatcher
                    .run_digest_once(conversations.as_ref(), messages.as_ref())
                    .await
                {
                    Ok(count) if count > 0 => tracing::info!(count, "digest notifications sent"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "digest run failed"),
                }
            }
        })
    }
}
