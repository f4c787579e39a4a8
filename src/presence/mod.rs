//! In-memory presence sessions. Presence is soft state: it lives with the
//! instance holding the socket and is rebuilt from reconnects after a
//! restart, so nothing here touches a store.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::websocket::events::PushFrame;

pub type SessionId = Uuid;

struct Session {
    sender: UnboundedSender<PushFrame>,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOutcome {
    pub session_id: SessionId,
    /// True when the user had no live session before this one.
    pub came_online: bool,
}

/// Live sessions per user. A user may hold several sessions (devices); the
/// user is online while at least one session is within its TTL.
#[derive(Clone)]
pub struct PresenceRegistry {
    ttl: Duration,
    inner: Arc<RwLock<HashMap<Uuid, HashMap<SessionId, Session>>>>,
}

impl PresenceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn live(session: &Session, now: Instant) -> bool {
        session.deadline > now
    }

    /// Register a session and hand back its id.
    pub async fn connect(&self, user_id: Uuid, sender: UnboundedSender<PushFrame>) -> ConnectOutcome {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let sessions = inner.entry(user_id).or_default();
        let came_online = !sessions.values().any(|s| Self::live(s, now));
        let session_id = Uuid::new_v4();
        sessions.insert(
            session_id,
            Session {
                sender,
                deadline: now + self.ttl,
            },
        );
        ConnectOutcome {
            session_id,
            came_online,
        }
    }

    /// Extend the session TTL. An expired session is gone for good; the
    /// client has to reconnect, which is a new session.
    pub async fn heartbeat(&self, user_id: Uuid, session_id: SessionId) -> AppResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let sessions = inner.get_mut(&user_id).ok_or(AppError::NotFound)?;
        match sessions.get_mut(&session_id) {
            Some(session) if Self::live(session, now) => {
                session.deadline = now + self.ttl;
                Ok(())
            }
            Some(_) => {
                sessions.remove(&session_id);
                Err(AppError::NotFound)
            }
            None => Err(AppError::NotFound),
        }
    }

    /// Drop a session. Returns true when that was the user's last live
    /// session, i.e. the user just went offline.
    pub async fn disconnect(&self, user_id: Uuid, session_id: SessionId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let Some(sessions) = inner.get_mut(&user_id) else {
            return false;
        };
        let existed = sessions.remove(&session_id).is_some();
        let went_offline = existed && !sessions.values().any(|s| Self::live(s, now));
        if sessions.is_empty() {
            inner.remove(&user_id);
        }
        went_offline
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .get(&user_id)
            .is_some_and(|sessions| sessions.values().any(|s| Self::live(s, now)))
    }

    /// Fan a frame out to every live session of each recipient. Returns the
    /// recipients that had no live session; missing them is not an error.
    pub async fn publish(&self, recipients: &[Uuid], frame: &PushFrame) -> Vec<Uuid> {
        let now = Instant::now();
        let mut missed = Vec::new();
        let mut inner = self.inner.write().await;
        for &recipient in recipients {
            let mut reached = false;
            if let Some(sessions) = inner.get_mut(&recipient) {
                // failed sends mean the socket is gone; drop those sessions
                sessions.retain(|_, session| {
                    if !Self::live(session, now) {
                        return true; // the sweeper owns expiry
                    }
                    match session.sender.send(frame.clone()) {
                        Ok(()) => {
                            reached = true;
                            true
                        }
                        Err(_) => false,
                    }
                });
            }
            if !reached {
                missed.push(recipient);
            }
        }
        missed
    }

    /// Remove expired sessions; returns users that went offline because
    /// their last session expired.
    pub async fn sweep_expired(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut went_offline = Vec::new();
        let mut inner = self.inner.write().await;
        inner.retain(|&user_id, sessions| {
            let had_live = sessions.values().any(|s| Self::live(s, now));
            sessions.retain(|_, s| Self::live(s, now));
            if sessions.is_empty() {
                if had_live {
                    went_offline.push(user_id);
                }
                false
            } else {
                true
            }
        });
        went_offline
    }

    /// Periodic expiry sweep, spawned at startup.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        mut on_offline: impl FnMut(Vec<Uuid>) + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = registry.sweep_expired().await;
                if !expired.is_empty() {
                    on_offline(expired);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Duration::from_secs(120))
    }

    fn channel() -> (
        UnboundedSender<PushFrame>,
        mpsc::UnboundedReceiver<PushFrame>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test(start_paused = true)]
    async fn session_expires_after_ttl_without_heartbeat() {
        let registry = registry();
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry.connect(user, tx).await;

        assert!(registry.is_online(user).await);
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!registry.is_online(user).await);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_the_session() {
        let registry = registry();
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        let outcome = registry.connect(user, tx).await;

        tokio::time::advance(Duration::from_secs(100)).await;
        registry.heartbeat(user, outcome.session_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(registry.is_online(user).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_cannot_be_resurrected_by_heartbeat() {
        let registry = registry();
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        let outcome = registry.connect(user, tx).await;

        tokio::time::advance(Duration::from_secs(121)).await;
        let err = registry.heartbeat(user, outcome.session_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
        assert!(!registry.is_online(user).await);
    }

    #[tokio::test]
    async fn disconnect_reports_offline_only_for_last_session() {
        let registry = registry();
        let user = Uuid::new_v4();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = registry.connect(user, tx1).await;
        let second = registry.connect(user, tx2).await;
        assert!(first.came_online);
        assert!(!second.came_online);

        assert!(!registry.disconnect(user, first.session_id).await);
        assert!(registry.disconnect(user, second.session_id).await);
    }

    #[tokio::test]
    async fn publish_reports_offline_recipients_as_missed() {
        let registry = registry();
        let online = Uuid::new_v4();
        let offline = Uuid::new_v4();
        let (tx, mut rx) = channel();
        registry.connect(online, tx).await;

        let frame = PushFrame::typing(Uuid::new_v4(), online);
        let missed = registry.publish(&[online, offline], &frame).await;
        assert_eq!(missed, vec![offline]);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reports_users_whose_last_session_expired() {
        let registry = registry();
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry.connect(user, tx).await;

        tokio::time::advance(Duration::from_secs(121)).await;
        let offline = registry.sweep_expired().await;
        assert_eq!(offline, vec![user]);
        assert!(registry.sweep_expired().await.is_empty());
    }
}
