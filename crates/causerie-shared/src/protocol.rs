//! Client↔server wire protocol.
//!
//! Events are JSON over WebSocket text frames, tagged by a `type` field.
//! Binary blobs (ciphertext, IVs) are base64 strings on the wire.
//!
//! The client speaks first: `authenticate` must arrive within the auth
//! timeout or the server drops the socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RejectKind;
use crate::events::MessageRecord;
use crate::types::{
    ContentType, ConversationId, DeliveryState, EncryptionMetadata, MessageId, PresenceStatus,
    UserId,
};

/// Events sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// First frame on every connection.
    Authenticate { token: String },

    SendMessage {
        conversation_id: ConversationId,
        #[serde(with = "base64_bytes")]
        encrypted_content: Vec<u8>,
        encryption: EncryptionMetadata,
        content_type: ContentType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },

    EditMessage {
        message_id: MessageId,
        #[serde(with = "base64_bytes")]
        encrypted_content: Vec<u8>,
    },

    DeleteMessage { message_id: MessageId },

    AckDelivered { message_id: MessageId },

    AckRead { message_id: MessageId },

    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },

    SetPresence { status: PresenceStatus },

    /// Plain history scroll-back (`cursor`), or gap-fill after reconnect
    /// (`after_seq`: everything newer than the given sequence, oldest
    /// first). The two modes are mutually exclusive.
    FetchHistory {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_seq: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

/// Events sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Authentication succeeded; subscriptions are live.
    Ready {
        user_id: UserId,
        session_id: crate::types::SessionId,
        protocol: String,
        conversations: Vec<ConversationId>,
    },

    /// Terminal success for the sender's own `send-message`.
    Acknowledged { message: MessageRecord },

    MessageNew { message: MessageRecord },

    MessageUpdated { message: MessageRecord },

    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    DeliveryChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryState,
        at: DateTime<Utc>,
    },

    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        at: DateTime<Utc>,
    },

    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    HistoryPage {
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_cursor: Option<String>,
    },

    Error { kind: RejectKind, detail: String },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Serde adapter: `Vec<u8>` ⇄ base64 string.
pub mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64_STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_json_round_trip() {
        let event = ClientEvent::SendMessage {
            conversation_id: ConversationId::new(),
            encrypted_content: vec![0xde, 0xad, 0xbe, 0xef],
            encryption: EncryptionMetadata {
                algorithm: "xchacha20poly1305".into(),
                iv: vec![7u8; 24],
                key_ref: "kx/session-1".into(),
            },
            content_type: ContentType::Text,
            reply_to: None,
        };

        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"send-message\""));
        assert_eq!(ClientEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn content_is_base64_on_the_wire() {
        let event = ClientEvent::EditMessage {
            message_id: MessageId::new(),
            encrypted_content: vec![1, 2, 3],
        };
        let json = event.to_json().unwrap();
        // [1, 2, 3] in standard base64
        assert!(json.contains("AQID"));
    }

    #[test]
    fn error_event_kind_is_kebab_case() {
        let event = ServerEvent::Error {
            kind: RejectKind::PersistenceFailure,
            detail: "store unavailable".into(),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("persistence-failure"));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = ClientEvent::from_json(r#"{"type":"launch-missiles"}"#);
        assert!(err.is_err());
    }
}
