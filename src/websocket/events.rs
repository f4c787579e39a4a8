use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageCreated,
    MessageEdited,
    ParticipantJoined,
    ParticipantLeft,
    PresenceChanged,
    Typing,
    ReadReceipt,
}

/// One server-push frame on the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    pub event_type: EventType,
    pub conversation_id: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PushFrame {
    fn new(event_type: EventType, conversation_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            conversation_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The frame carries the stored ciphertext, base64-encoded for the JSON
    /// transport. Plaintext never crosses the push channel; recipients
    /// decrypt through the read path.
    pub fn message_created(message: &Message) -> Self {
        Self::new(
            EventType::MessageCreated,
            message.conversation_id,
            json!({
                "message_id": message.id,
                "sender_id": message.sender_id,
                "sequence_number": message.sequence_number,
                "ciphertext": STANDARD.encode(&message.ciphertext),
            }),
        )
    }

    pub fn message_edited(message: &Message) -> Self {
        Self::new(
            EventType::MessageEdited,
            message.conversation_id,
            json!({
                "message_id": message.id,
                "sender_id": message.sender_id,
                "sequence_number": message.sequence_number,
                "ciphertext": STANDARD.encode(&message.ciphertext),
                "edited_at": message.edited_at,
            }),
        )
    }

    pub fn participant_joined(conversation_id: Uuid, user_id: Uuid) -> Self {
        Self::new(
            EventType::ParticipantJoined,
            conversation_id,
            json!({ "user_id": user_id }),
        )
    }

    pub fn participant_left(conversation_id: Uuid, user_id: Uuid) -> Self {
        Self::new(
            EventType::ParticipantLeft,
            conversation_id,
            json!({ "user_id": user_id }),
        )
    }

    pub fn presence_changed(conversation_id: Uuid, user_id: Uuid, online: bool) -> Self {
        Self::new(
            EventType::PresenceChanged,
            conversation_id,
            json!({ "user_id": user_id, "online": online }),
        )
    }

    pub fn typing(conversation_id: Uuid, user_id: Uuid) -> Self {
        Self::new(
            EventType::Typing,
            conversation_id,
            json!({ "user_id": user_id }),
        )
    }

    pub fn read_receipt(conversation_id: Uuid, user_id: Uuid, up_to_seq: i64) -> Self {
        Self::new(
            EventType::ReadReceipt,
            conversation_id,
            json!({ "user_id": user_id, "up_to_seq": up_to_seq }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_serialize_snake_case() {
        let frame = PushFrame::typing(Uuid::nil(), Uuid::nil());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event_type"], "typing");
    }

    #[test]
    fn message_created_frame_carries_encoded_ciphertext() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sequence_number: 7,
            ciphertext: vec![1, 2, 3],
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        };
        let frame = PushFrame::message_created(&message);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["payload"]["sequence_number"], 7);
        let encoded = value["payload"]["ciphertext"].as_str().unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn message_edited_frame_carries_encoded_ciphertext() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sequence_number: 3,
            ciphertext: vec![4, 5, 6],
            created_at: Utc::now(),
            edited_at: Some(Utc::now()),
            deleted: false,
        };
        let frame = PushFrame::message_edited(&message);
        let value = serde_json::to_value(&frame).unwrap();
        let encoded = value["payload"]["ciphertext"].as_str().unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), vec![4, 5, 6]);
    }
}
