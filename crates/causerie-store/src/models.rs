//! Domain model structs persisted in the database.
//!
//! The persisted message itself is [`causerie_shared::events::MessageRecord`]:
//! the same record flows from the store onto the bus and out to clients, so
//! it lives in the shared crate rather than here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use causerie_shared::types::{
    ContentType, ConversationId, ConversationKind, DeliveryState, EncryptionMetadata, MessageId,
    ParticipantRole, UserId,
};

/// A conversation: a two-party DM or a named group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Display name; groups only, `None` for direct conversations.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Membership of one user in one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    /// Highest sequence this user has read, if any.
    pub last_read_seq: Option<i64>,
}

/// One delivery-status row per (message, recipient).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub status: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`crate::Database::append_message`]: everything the store does
/// not assign itself (id comes from the pipeline so retries stay
/// idempotent; sequence and timestamps are assigned at insert).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub encrypted_content: Vec<u8>,
    pub content_type: ContentType,
    pub encryption: EncryptionMetadata,
    pub reply_to: Option<MessageId>,
}

/// One page of history, newest first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<causerie_shared::events::MessageRecord>,
    /// Present when older messages may remain; opaque to callers.
    pub next_cursor: Option<String>,
}
