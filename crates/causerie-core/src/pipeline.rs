//! The message pipeline: validate → persist → publish.
//!
//! Persistence is the single source of truth. A message is never published
//! before its durable append, so recipients can never see a phantom
//! message that vanishes on store failure. After the append, publishing is
//! retried with bounded backoff; if the bus stays down the send is still
//! acknowledged (the message is durable) and recipients catch up through
//! history fetch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use causerie_bus::DistributionBus;
use causerie_shared::constants::{
    DEFAULT_PAGE_LIMIT, MAX_CONTENT_SIZE, MAX_PAGE_LIMIT, PUBLISH_RETRY_ATTEMPTS,
    PUBLISH_RETRY_BASE_MS,
};
use causerie_shared::error::RejectKind;
use causerie_shared::events::{BusEvent, MessageRecord};
use causerie_shared::types::{
    ContentType, ConversationId, DeliveryState, EncryptionMetadata, MessageId, UserId,
};
use causerie_store::{MessagePage, NewMessage, StoreError};

use crate::collab::KeyExchange;
use crate::store::SharedStore;

/// A send request as it arrives from the wire, before validation.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub conversation_id: ConversationId,
    pub encrypted_content: Vec<u8>,
    pub encryption: EncryptionMetadata,
    pub content_type: ContentType,
    pub reply_to: Option<MessageId>,
}

/// Terminal rejection of a pipeline operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("persistence failure: {0}")]
    Persistence(StoreError),
}

impl PipelineError {
    /// The wire-level rejection kind for this error.
    pub fn reject_kind(&self) -> RejectKind {
        match self {
            Self::InvalidMessage(_) => RejectKind::InvalidMessage,
            Self::Forbidden => RejectKind::Forbidden,
            Self::NotFound => RejectKind::NotFound,
            Self::Persistence(_) => RejectKind::PersistenceFailure,
        }
    }

    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Forbidden => Self::Forbidden,
            StoreError::Invariant(msg) => Self::InvalidMessage(msg),
            StoreError::InvalidCursor => Self::InvalidMessage("invalid cursor".into()),
            other => Self::Persistence(other),
        }
    }
}

/// Bounded backoff for publish retries after a durable append.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: PUBLISH_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(PUBLISH_RETRY_BASE_MS),
        }
    }
}

pub struct MessagePipeline {
    store: SharedStore,
    bus: Arc<dyn DistributionBus>,
    key_exchange: Arc<dyn KeyExchange>,
    retry: RetryPolicy,
}

impl MessagePipeline {
    pub fn new(
        store: SharedStore,
        bus: Arc<dyn DistributionBus>,
        key_exchange: Arc<dyn KeyExchange>,
    ) -> Self {
        Self {
            store,
            bus,
            key_exchange,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Ingest a message. On `Ok` the message is durable and the sender may
    /// treat it as acknowledged; live fan-out may still be catching up.
    pub async fn send(
        &self,
        sender: UserId,
        inbound: InboundMessage,
    ) -> Result<MessageRecord, PipelineError> {
        self.validate(sender, &inbound).await?;

        let new = NewMessage {
            id: MessageId::new(),
            conversation_id: inbound.conversation_id,
            sender,
            encrypted_content: inbound.encrypted_content,
            content_type: inbound.content_type,
            encryption: inbound.encryption,
            reply_to: inbound.reply_to,
        };

        let record = self
            .store
            .append_message(&new)
            .await
            .map_err(PipelineError::from_store)?;

        debug!(
            message = %record.id,
            conversation = %record.conversation_id,
            seq = record.sequence,
            "message persisted"
        );

        self.publish_with_retry(
            &record.conversation_id.to_topic(),
            BusEvent::MessageNew(record.clone()),
        )
        .await;

        Ok(record)
    }

    /// Structural and permission checks, before anything touches disk.
    async fn validate(&self, sender: UserId, inbound: &InboundMessage) -> Result<(), PipelineError> {
        if inbound.encrypted_content.is_empty() {
            return Err(PipelineError::InvalidMessage(
                "empty encrypted content".into(),
            ));
        }
        if inbound.encrypted_content.len() > MAX_CONTENT_SIZE {
            return Err(PipelineError::InvalidMessage(format!(
                "content exceeds {MAX_CONTENT_SIZE} bytes"
            )));
        }
        if !self.key_exchange.validate(&inbound.encryption) {
            return Err(PipelineError::InvalidMessage(
                "encryption metadata rejected".into(),
            ));
        }

        // Conversation must exist and the sender must be in it.
        self.store
            .get_conversation(inbound.conversation_id)
            .await
            .map_err(PipelineError::from_store)?;
        if !self
            .store
            .is_participant(inbound.conversation_id, sender)
            .await
            .map_err(PipelineError::from_store)?
        {
            return Err(PipelineError::Forbidden);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Edit / delete
    // ------------------------------------------------------------------

    /// Replace a message's content. Sender-only; identity and sequence are
    /// preserved.
    pub async fn edit(
        &self,
        caller: UserId,
        message_id: MessageId,
        new_content: Vec<u8>,
    ) -> Result<MessageRecord, PipelineError> {
        if new_content.is_empty() {
            return Err(PipelineError::InvalidMessage(
                "empty encrypted content".into(),
            ));
        }
        if new_content.len() > MAX_CONTENT_SIZE {
            return Err(PipelineError::InvalidMessage(format!(
                "content exceeds {MAX_CONTENT_SIZE} bytes"
            )));
        }

        let record = self
            .store
            .edit_message(message_id, caller, &new_content)
            .await
            .map_err(PipelineError::from_store)?;

        self.publish_with_retry(
            &record.conversation_id.to_topic(),
            BusEvent::MessageUpdated(record.clone()),
        )
        .await;

        Ok(record)
    }

    /// Tombstone a message. Sender-only; idempotent at the store level.
    pub async fn delete(
        &self,
        caller: UserId,
        message_id: MessageId,
    ) -> Result<MessageRecord, PipelineError> {
        let current = self
            .store
            .get_message(message_id)
            .await
            .map_err(PipelineError::from_store)?;
        if current.sender != caller {
            return Err(PipelineError::Forbidden);
        }

        let record = self
            .store
            .mark_message_deleted(message_id)
            .await
            .map_err(PipelineError::from_store)?;

        self.publish_with_retry(
            &record.conversation_id.to_topic(),
            BusEvent::MessageDeleted {
                conversation_id: record.conversation_id,
                message_id: record.id,
            },
        )
        .await;

        Ok(record)
    }

    // ------------------------------------------------------------------
    // Delivery acknowledgements
    // ------------------------------------------------------------------

    /// Record a delivery/read ack from a recipient. Stale or duplicate
    /// acks are absorbed silently; only a real advance is broadcast.
    pub async fn ack(
        &self,
        user_id: UserId,
        message_id: MessageId,
        status: DeliveryState,
    ) -> Result<(), PipelineError> {
        let record = self
            .store
            .get_message(message_id)
            .await
            .map_err(PipelineError::from_store)?;
        if !self
            .store
            .is_participant(record.conversation_id, user_id)
            .await
            .map_err(PipelineError::from_store)?
        {
            return Err(PipelineError::Forbidden);
        }

        let outcome = self
            .store
            .record_delivery(message_id, user_id, status)
            .await
            .map_err(PipelineError::from_store)?;

        if !outcome.advanced {
            return Ok(());
        }

        if status == DeliveryState::Read {
            self.store
                .set_last_read(record.conversation_id, user_id, record.sequence)
                .await
                .map_err(PipelineError::from_store)?;
        }

        self.publish_with_retry(
            &record.conversation_id.to_topic(),
            BusEvent::DeliveryChanged {
                conversation_id: record.conversation_id,
                message_id,
                user_id,
                status: outcome.status,
                at: Utc::now(),
            },
        )
        .await;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Typing (relay only, never persisted)
    // ------------------------------------------------------------------

    pub async fn typing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), PipelineError> {
        if !self
            .store
            .is_participant(conversation_id, user_id)
            .await
            .map_err(PipelineError::from_store)?
        {
            return Err(PipelineError::Forbidden);
        }

        // Best effort: a lost typing indicator costs nothing.
        let event = BusEvent::TypingChanged {
            conversation_id,
            user_id,
            is_typing,
        };
        if let Ok(bytes) = event.to_bytes() {
            let _ = self.bus.publish(&conversation_id.to_topic(), bytes.into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// One page of history for a participant, newest first.
    pub async fn fetch_history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<MessagePage, PipelineError> {
        if !self
            .store
            .is_participant(conversation_id, user_id)
            .await
            .map_err(PipelineError::from_store)?
        {
            return Err(PipelineError::Forbidden);
        }

        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
        self.store
            .fetch_page(conversation_id, cursor, limit)
            .await
            .map_err(PipelineError::from_store)
    }

    /// Messages a reconnecting participant missed: everything after the
    /// highest sequence it has seen, oldest first. A full page means more
    /// may remain; the client resumes from the last sequence it received.
    pub async fn fetch_missed(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        after_seq: i64,
        limit: Option<u32>,
    ) -> Result<Vec<MessageRecord>, PipelineError> {
        if !self
            .store
            .is_participant(conversation_id, user_id)
            .await
            .map_err(PipelineError::from_store)?
        {
            return Err(PipelineError::Forbidden);
        }

        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
        self.store
            .fetch_since(conversation_id, after_seq, limit)
            .await
            .map_err(PipelineError::from_store)
    }

    // ------------------------------------------------------------------
    // Publish with bounded backoff
    // ------------------------------------------------------------------

    /// Publish an event for an already-durable change. Failures are retried
    /// with doubling backoff; on exhaustion the event is dropped and the
    /// degradation logged (recipients recover via history fetch).
    async fn publish_with_retry(&self, topic: &str, event: BusEvent) {
        let bytes = match event.to_bytes() {
            Ok(b) => bytes::Bytes::from(b),
            Err(e) => {
                warn!(topic, error = %e, "bus event serialization failed");
                return;
            }
        };

        let mut delay = self.retry.base_delay;
        for attempt in 1..=self.retry.attempts {
            match self.bus.publish(topic, bytes.clone()) {
                Ok(()) => return,
                Err(e) if attempt < self.retry.attempts => {
                    debug!(topic, attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(
                        topic,
                        attempts = self.retry.attempts,
                        error = %e,
                        "publish retries exhausted; event durable but not broadcast"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use causerie_bus::{BusError, InProcessBus, Subscription};
    use causerie_store::Database;

    use crate::collab::StructuralKeyExchange;

    fn user(n: u8) -> UserId {
        UserId([n; 32])
    }

    fn metadata() -> EncryptionMetadata {
        EncryptionMetadata {
            algorithm: "xchacha20poly1305".into(),
            iv: vec![0u8; 24],
            key_ref: "kx/test".into(),
        }
    }

    fn inbound(conversation_id: ConversationId, body: &[u8]) -> InboundMessage {
        InboundMessage {
            conversation_id,
            encrypted_content: body.to_vec(),
            encryption: metadata(),
            content_type: ContentType::Text,
            reply_to: None,
        }
    }

    struct Fixture {
        pipeline: MessagePipeline,
        store: SharedStore,
        bus: Arc<InProcessBus>,
        conversation_id: ConversationId,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let conversation = db.create_direct_conversation(user(1), user(2)).unwrap();
        let store = SharedStore::new(db);
        let bus = Arc::new(InProcessBus::new());
        let pipeline = MessagePipeline::new(
            store.clone(),
            bus.clone(),
            Arc::new(StructuralKeyExchange),
        );
        Fixture {
            pipeline,
            store,
            bus,
            conversation_id: conversation.id,
        }
    }

    async fn next_event(sub: &mut Subscription) -> BusEvent {
        BusEvent::from_bytes(&sub.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn hello_reaches_the_subscribed_recipient() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe(&fx.conversation_id.to_topic());

        let ack = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"hello(encrypted)"))
            .await
            .unwrap();

        assert_eq!(ack.sequence, 1);
        assert_eq!(ack.sender, user(1));

        match next_event(&mut sub).await {
            BusEvent::MessageNew(record) => {
                assert_eq!(record.id, ack.id);
                assert_eq!(record.sequence, 1);
                assert_eq!(record.encrypted_content, b"hello(encrypted)");
            }
            other => panic!("expected MessageNew, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_and_oversized_content_are_rejected() {
        let fx = fixture().await;

        let err = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b""))
            .await
            .unwrap_err();
        assert_eq!(err.reject_kind(), RejectKind::InvalidMessage);

        let oversized = vec![0u8; MAX_CONTENT_SIZE + 1];
        let err = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, &oversized))
            .await
            .unwrap_err();
        assert_eq!(err.reject_kind(), RejectKind::InvalidMessage);
    }

    #[tokio::test]
    async fn non_participant_sender_is_forbidden() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .send(user(9), inbound(fx.conversation_id, b"hi"))
            .await
            .unwrap_err();
        assert_eq!(err.reject_kind(), RejectKind::Forbidden);
    }

    #[tokio::test]
    async fn bad_encryption_metadata_is_rejected() {
        let fx = fixture().await;
        let mut msg = inbound(fx.conversation_id, b"x");
        msg.encryption.key_ref.clear();

        let err = fx.pipeline.send(user(1), msg).await.unwrap_err();
        assert_eq!(err.reject_kind(), RejectKind::InvalidMessage);
    }

    #[tokio::test]
    async fn store_fault_means_nothing_is_published() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe(&fx.conversation_id.to_topic());

        // Force a store fault after validation would pass.
        fx.store
            .with_database(|db| {
                db.conn()
                    .execute_batch("DROP TABLE delivery_status; DROP TABLE messages;")
            })
            .await
            .unwrap();

        let err = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"phantom"))
            .await
            .unwrap_err();
        assert_eq!(err.reject_kind(), RejectKind::PersistenceFailure);

        // No MessageNew leaked: the next thing on the topic is our sentinel.
        fx.bus
            .publish(
                &fx.conversation_id.to_topic(),
                bytes::Bytes::from_static(b"sentinel"),
            )
            .unwrap();
        assert_eq!(
            sub.recv().await.unwrap(),
            bytes::Bytes::from_static(b"sentinel")
        );
    }

    #[tokio::test]
    async fn foreign_edit_is_forbidden_and_content_untouched() {
        let fx = fixture().await;
        let ack = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"v1"))
            .await
            .unwrap();

        let err = fx
            .pipeline
            .edit(user(2), ack.id, b"v2".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.reject_kind(), RejectKind::Forbidden);

        let stored = fx.store.get_message(ack.id).await.unwrap();
        assert_eq!(stored.encrypted_content, b"v1");
        assert!(!stored.is_edited);
    }

    #[tokio::test]
    async fn edit_publishes_an_update_event() {
        let fx = fixture().await;
        let ack = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"v1"))
            .await
            .unwrap();

        let mut sub = fx.bus.subscribe(&fx.conversation_id.to_topic());
        fx.pipeline.edit(user(1), ack.id, b"v2".to_vec()).await.unwrap();

        match next_event(&mut sub).await {
            BusEvent::MessageUpdated(record) => {
                assert_eq!(record.id, ack.id);
                assert!(record.is_edited);
                assert_eq!(record.encrypted_content, b"v2");
            }
            other => panic!("expected MessageUpdated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_publishes_a_tombstone_event() {
        let fx = fixture().await;
        let ack = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"gone"))
            .await
            .unwrap();

        // Only the sender may delete.
        assert!(matches!(
            fx.pipeline.delete(user(2), ack.id).await,
            Err(PipelineError::Forbidden)
        ));

        let mut sub = fx.bus.subscribe(&fx.conversation_id.to_topic());
        fx.pipeline.delete(user(1), ack.id).await.unwrap();

        match next_event(&mut sub).await {
            BusEvent::MessageDeleted { message_id, .. } => assert_eq!(message_id, ack.id),
            other => panic!("expected MessageDeleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_before_delivered_jumps_forward() {
        let fx = fixture().await;
        let ack = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"m"))
            .await
            .unwrap();

        let mut sub = fx.bus.subscribe(&fx.conversation_id.to_topic());
        fx.pipeline
            .ack(user(2), ack.id, DeliveryState::Read)
            .await
            .unwrap();

        match next_event(&mut sub).await {
            BusEvent::DeliveryChanged { status, user_id, .. } => {
                assert_eq!(status, DeliveryState::Read);
                assert_eq!(user_id, user(2));
            }
            other => panic!("expected DeliveryChanged, got {other:?}"),
        }

        // A late `delivered` is absorbed: no further event on the topic.
        fx.pipeline
            .ack(user(2), ack.id, DeliveryState::Delivered)
            .await
            .unwrap();
        fx.bus
            .publish(
                &fx.conversation_id.to_topic(),
                bytes::Bytes::from_static(b"sentinel"),
            )
            .unwrap();
        assert_eq!(
            sub.recv().await.unwrap(),
            bytes::Bytes::from_static(b"sentinel")
        );
    }

    #[tokio::test]
    async fn read_ack_advances_the_last_read_marker() {
        let fx = fixture().await;
        let ack = fx
            .pipeline
            .send(user(1), inbound(fx.conversation_id, b"m"))
            .await
            .unwrap();

        fx.pipeline
            .ack(user(2), ack.id, DeliveryState::Read)
            .await
            .unwrap();

        let reader = fx
            .store
            .participants(fx.conversation_id)
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.user_id == user(2))
            .unwrap();
        assert_eq!(reader.last_read_seq, Some(ack.sequence));
    }

    #[tokio::test]
    async fn history_is_participant_gated() {
        let fx = fixture().await;
        fx.pipeline
            .send(user(1), inbound(fx.conversation_id, b"m"))
            .await
            .unwrap();

        assert!(matches!(
            fx.pipeline
                .fetch_history(user(9), fx.conversation_id, None, None)
                .await,
            Err(PipelineError::Forbidden)
        ));

        let page = fx
            .pipeline
            .fetch_history(user(2), fx.conversation_id, None, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn reconnect_gap_fill_returns_only_newer_messages() {
        let fx = fixture().await;
        for body in [&b"m1"[..], b"m2", b"m3"] {
            fx.pipeline
                .send(user(1), inbound(fx.conversation_id, body))
                .await
                .unwrap();
        }

        // A client that last saw sequence 1 gets 2 and 3, oldest first.
        let missed = fx
            .pipeline
            .fetch_missed(user(2), fx.conversation_id, 1, None)
            .await
            .unwrap();
        assert_eq!(
            missed.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );

        // Caught up means empty, not an error.
        let missed = fx
            .pipeline
            .fetch_missed(user(2), fx.conversation_id, 3, None)
            .await
            .unwrap();
        assert!(missed.is_empty());

        assert!(matches!(
            fx.pipeline
                .fetch_missed(user(9), fx.conversation_id, 0, None)
                .await,
            Err(PipelineError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn typing_is_relayed_not_persisted() {
        let fx = fixture().await;
        let mut sub = fx.bus.subscribe(&fx.conversation_id.to_topic());

        fx.pipeline
            .typing(user(1), fx.conversation_id, true)
            .await
            .unwrap();

        match next_event(&mut sub).await {
            BusEvent::TypingChanged {
                user_id, is_typing, ..
            } => {
                assert_eq!(user_id, user(1));
                assert!(is_typing);
            }
            other => panic!("expected TypingChanged, got {other:?}"),
        }

        // Nothing landed in history.
        let page = fx
            .pipeline
            .fetch_history(user(1), fx.conversation_id, None, None)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    // A bus that always fails, for retry-exhaustion behavior.
    struct DeadBus;

    impl DistributionBus for DeadBus {
        fn publish(&self, _topic: &str, _payload: bytes::Bytes) -> Result<(), BusError> {
            Err(BusError::Unavailable("down".into()))
        }
        fn subscribe(&self, _topic: &str) -> Subscription {
            unimplemented!("DeadBus has no subscribers")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bus_outage_still_acknowledges_a_durable_send() {
        let db = Database::open_in_memory().unwrap();
        let conversation = db.create_direct_conversation(user(1), user(2)).unwrap();
        let store = SharedStore::new(db);
        let pipeline = MessagePipeline::new(
            store.clone(),
            Arc::new(DeadBus),
            Arc::new(StructuralKeyExchange),
        );

        let ack = pipeline
            .send(user(1), inbound(conversation.id, b"durable"))
            .await
            .unwrap();

        // Durable despite the dead bus; recipients recover via history.
        let stored = store.get_message(ack.id).await.unwrap();
        assert_eq!(stored.encrypted_content, b"durable");
    }
}
