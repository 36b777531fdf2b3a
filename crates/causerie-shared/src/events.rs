//! Events carried on the distribution bus.
//!
//! Bus payloads are opaque `Vec<u8>` at the transport layer and typed here
//! at the edges. Delivery is at-least-once; every consumer must tolerate
//! duplicates (message ids are stable, so dedup is cheap).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ContentType, ConversationId, DeliveryState, EncryptionMetadata, MessageId, PresenceStatus,
    UserId,
};

/// A persisted message as it travels over the bus and out to clients.
///
/// This is the post-append view: `sequence` has been assigned and is the
/// authoritative ordering position within the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Per-conversation monotonic position. Never reused, even by tombstones.
    pub sequence: i64,
    pub sender: UserId,
    /// Opaque ciphertext. Empty once the message is tombstoned.
    #[serde(with = "crate::protocol::base64_bytes")]
    pub encrypted_content: Vec<u8>,
    pub content_type: ContentType,
    pub encryption: EncryptionMetadata,
    pub reply_to: Option<MessageId>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// All event kinds published on the distribution bus.
///
/// Conversation-scoped events go to the conversation topic; presence goes to
/// the reserved presence topic. Delivery-status updates reuse the
/// conversation topic (every participant is already subscribed there).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BusEvent {
    /// A new message was durably appended.
    MessageNew(MessageRecord),

    /// An existing message's content was replaced by its sender.
    MessageUpdated(MessageRecord),

    /// A message was tombstoned.
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// A recipient's delivery status for a message advanced.
    DeliveryChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryState,
        at: DateTime<Utc>,
    },

    /// A user's presence changed.
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        at: DateTime<Utc>,
    },

    /// A user started or stopped typing. Never persisted.
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
}

impl BusEvent {
    /// Serialize to binary (bincode) for the bus.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
