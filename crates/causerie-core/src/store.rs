//! Async handle over the synchronous store.
//!
//! Connection tasks never touch `rusqlite` directly: they go through
//! [`SharedStore`], which serializes access behind a `tokio::sync::Mutex`.
//! Critical sections are single statements or short transactions, so a
//! suspended caller never holds the lock across an await point it does not
//! control. Together with the transactional sequence assignment this mutex
//! is the append serialization point; sharding it by conversation id is a
//! scaling option the contract deliberately does not require.

use std::sync::Arc;

use tokio::sync::Mutex;

use causerie_shared::events::MessageRecord;
use causerie_shared::types::{ConversationId, DeliveryState, MessageId, UserId};
use causerie_store::delivery::DeliveryOutcome;
use causerie_store::{Conversation, Database, MessagePage, NewMessage, Participant, StoreError};

/// Cheaply cloneable async store handle.
#[derive(Clone)]
pub struct SharedStore {
    db: Arc<Mutex<Database>>,
}

impl SharedStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn append_message(&self, new: &NewMessage) -> Result<MessageRecord, StoreError> {
        self.db.lock().await.append_message(new)
    }

    pub async fn get_message(&self, id: MessageId) -> Result<MessageRecord, StoreError> {
        self.db.lock().await.get_message(id)
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        caller: UserId,
        new_content: &[u8],
    ) -> Result<MessageRecord, StoreError> {
        self.db.lock().await.edit_message(message_id, caller, new_content)
    }

    pub async fn mark_message_deleted(
        &self,
        message_id: MessageId,
    ) -> Result<MessageRecord, StoreError> {
        self.db.lock().await.mark_message_deleted(message_id)
    }

    pub async fn record_delivery(
        &self,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryState,
    ) -> Result<DeliveryOutcome, StoreError> {
        self.db.lock().await.record_delivery(message_id, user_id, status)
    }

    pub async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage, StoreError> {
        self.db.lock().await.fetch_page(conversation_id, cursor, limit)
    }

    pub async fn fetch_since(
        &self,
        conversation_id: ConversationId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.db.lock().await.fetch_since(conversation_id, after_seq, limit)
    }

    pub async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Conversation, StoreError> {
        self.db.lock().await.get_conversation(id)
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        self.db.lock().await.is_participant(conversation_id, user_id)
    }

    pub async fn participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Participant>, StoreError> {
        self.db.lock().await.participants(conversation_id)
    }

    pub async fn conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationId>, StoreError> {
        self.db.lock().await.conversations_for_user(user_id)
    }

    pub async fn set_last_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        seq: i64,
    ) -> Result<(), StoreError> {
        self.db.lock().await.set_last_read(conversation_id, user_id, seq)
    }

    /// Run a closure against the raw database. Test-only escape hatch for
    /// fault injection and ad-hoc assertions.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn with_database<R>(&self, f: impl FnOnce(&mut Database) -> R) -> R {
        let mut db = self.db.lock().await;
        f(&mut db)
    }
}
