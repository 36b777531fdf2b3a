//! # causerie-bus
//!
//! The distribution bus: publish/subscribe fan-out keyed by topic strings.
//! Topics are conversation ids (`conversation:<uuid>`) plus the reserved
//! presence topic.
//!
//! Delivery is at-least-once: consumers must tolerate duplicates, and a
//! receiver that falls behind observes a lag signal rather than blocking
//! publishers (missed live events are recovered via history fetch, which is
//! why the pipeline persists before publishing).
//!
//! [`InProcessBus`] is the single-process implementation; a broker-backed
//! implementation satisfies the same [`DistributionBus`] contract for
//! multi-server deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of each per-topic channel; slower receivers past this lag.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    /// The bus transport is unavailable. The in-process bus never raises
    /// this; broker-backed implementations do.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by [`Subscription::recv`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The receiver fell behind and `skipped` events were dropped. The
    /// subscription is still live; callers gap-fill from the store.
    #[error("subscription lagged, {skipped} events skipped")]
    Lagged { skipped: u64 },

    /// The topic was torn down.
    #[error("subscription closed")]
    Closed,
}

/// Publish/subscribe fan-out across whatever shares conversation traffic.
///
/// Payloads are opaque bytes; `causerie_shared::events::BusEvent` is the
/// framing used at the edges.
pub trait DistributionBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// A live subscription to one topic.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Bytes>,
}

impl Subscription {
    /// Wait for the next event on the topic.
    pub async fn recv(&mut self) -> Result<Bytes, SubscriptionError> {
        match self.rx.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(topic = %self.topic, skipped, "subscription lagged");
                Err(SubscriptionError::Lagged { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Process-local bus: one broadcast channel per topic, created lazily.
#[derive(Default)]
pub struct InProcessBus {
    topics: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Bytes> {
        // Fast path: topic already exists.
        if let Some(tx) = self.topics.read().expect("bus lock").get(topic) {
            return tx.clone();
        }

        let mut topics = self.topics.write().expect("bus lock");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl DistributionBus for InProcessBus {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let tx = self.sender_for(topic);
        // A topic with no current subscribers is not an error; the event is
        // simply not live-delivered (history fetch covers late joiners).
        let delivered = tx.send(payload).unwrap_or(0);
        debug!(topic, delivered, "published bus event");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            rx: self.sender_for(topic).subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("conversation:abc");

        bus.publish("conversation:abc", Bytes::from_static(b"hello"))
            .unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InProcessBus::new();
        let mut sub_a = bus.subscribe("a");
        let mut sub_b = bus.subscribe("b");

        bus.publish("a", Bytes::from_static(b"for-a")).unwrap();
        bus.publish("b", Bytes::from_static(b"for-b")).unwrap();

        assert_eq!(sub_a.recv().await.unwrap(), Bytes::from_static(b"for-a"));
        assert_eq!(sub_b.recv().await.unwrap(), Bytes::from_static(b"for-b"));
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = InProcessBus::new();
        let mut sub1 = bus.subscribe("t");
        let mut sub2 = bus.subscribe("t");
        let mut sub3 = bus.subscribe("t");

        bus.publish("t", Bytes::from_static(b"x")).unwrap();

        for sub in [&mut sub1, &mut sub2, &mut sub3] {
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"x"));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcessBus::new();
        bus.publish("empty", Bytes::from_static(b"void")).unwrap();
    }

    #[tokio::test]
    async fn lagged_receiver_gets_a_lag_signal_then_resumes() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("t");

        for i in 0..(TOPIC_CAPACITY + 10) {
            bus.publish("t", Bytes::from(vec![i as u8])).unwrap();
        }

        match sub.recv().await {
            Err(SubscriptionError::Lagged { skipped }) => assert!(skipped >= 10),
            other => panic!("expected lag signal, got {other:?}"),
        }

        // Still live after the lag.
        assert!(sub.recv().await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_publishes_are_delivered_twice() {
        // At-least-once: the bus does not dedup; consumers do.
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("t");

        bus.publish("t", Bytes::from_static(b"same")).unwrap();
        bus.publish("t", Bytes::from_static(b"same")).unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"same"));
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"same"));
    }
}
