use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a conversation. `Open -> Closed -> Archived`; archived is
/// terminal and only the retention sweeper removes archived rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ConversationStatus::Open),
            "closed" => Some(ConversationStatus::Closed),
            "archived" => Some(ConversationStatus::Archived),
            _ => None,
        }
    }
}

/// Shape of a conversation. Contextual conversations hang off an external
/// business object and must carry a [`ContextRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
    Contextual,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Direct => "direct",
            ConversationType::Group => "group",
            ConversationType::Contextual => "contextual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationType::Direct),
            "group" => Some(ConversationType::Group),
            "contextual" => Some(ConversationType::Contextual),
            _ => None,
        }
    }

    pub fn requires_context(&self) -> bool {
        matches!(self, ConversationType::Contextual)
    }
}

/// The external business object a contextual conversation is tied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub context_type: String,
    pub context_id: Uuid,
}

/// Why a conversation left the open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ModeratorRequest,
    LastParticipantLeft,
    Inactivity,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ModeratorRequest => "moderator_request",
            CloseReason::LastParticipantLeft => "last_participant_left",
            CloseReason::Inactivity => "inactivity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "moderator_request" => Some(CloseReason::ModeratorRequest),
            "last_participant_left" => Some(CloseReason::LastParticipantLeft),
            "inactivity" => Some(CloseReason::Inactivity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub topic: String,
    pub conversation_type: ConversationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextRef>,
    pub initiator_id: Uuid,
    pub status: ConversationStatus,
    pub close_reason: Option<CloseReason>,
    /// Roster ceiling for this conversation, within the platform maximum.
    pub max_participants: usize,
    pub confidential: bool,
    /// Set by an administrator; suppresses all sends regardless of
    /// per-participant mute state.
    pub system_muted: bool,
    /// Per-conversation message retention override, in days.
    pub retention_days: i64,
    /// Inactivity window after which the sweeper closes the conversation.
    pub auto_close_days: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_open(&self) -> bool {
        self.status == ConversationStatus::Open
    }
}
