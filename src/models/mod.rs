pub mod conversation;
pub mod message;
pub mod participant;

pub use conversation::{
    CloseReason, ContextRef, Conversation, ConversationStatus, ConversationType,
};
pub use message::{DeliveryReceipt, DeliveryStatus, Message};
pub use participant::{Participant, ParticipantRole};
