//! Fire-and-forget audit recording. Callers never wait on the audit
//! collaborator; events go through a local queue whose worker retries a
//! bounded number of times and then drops the event with an error log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::error::AppResult;

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub action: String,
    pub target_type: String,
    pub target_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor_id: Uuid, action: &str, target_type: &str, target_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id,
            occurred_at: Utc::now(),
        }
    }
}

/// The external audit storage collaborator.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_event(&self, event: AuditEvent) -> AppResult<()>;

    /// Remove events older than the cutoff; returns how many were removed.
    /// Drives the audit leg of the retention sweep.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

/// In-memory audit sink for tests and dev.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_event(&self, event: AuditEvent) -> AppResult<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|e| e.occurred_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

/// Local queue in front of the audit sink. `record` never blocks and never
/// fails the calling operation.
#[derive(Clone)]
pub struct AuditTrail {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditTrail {
    pub fn spawn(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut attempt = 0;
                loop {
                    match sink.record_event(event.clone()).await {
                        Ok(()) => break,
                        Err(e) if attempt < MAX_RETRIES => {
                            attempt += 1;
                            tracing::warn!(
                                error = %e,
                                attempt,
                                action = %event.action,
                                "audit record failed, retrying"
                            );
                            sleep(RETRY_BACKOFF).await;
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                action = %event.action,
                                event_id = %event.id,
                                "audit record dropped after retries"
                            );
                            break;
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn record(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            tracing::error!("audit worker gone, event dropped");
        }
    }
}
