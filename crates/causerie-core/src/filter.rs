//! Per-connection fan-out filter: duplicate suppression and block-list
//! enforcement.
//!
//! The bus is at-least-once, so the same message event can reach a
//! connection twice; message ids are stable, so a small in-memory window of
//! recently delivered ids absorbs the duplicates. The filter also drops
//! events from senders the connection's user has blocked, and the sender's
//! own `message-new` echo (their confirmation is the pipeline ack).

use std::collections::{HashSet, VecDeque};

use causerie_shared::events::BusEvent;
use causerie_shared::types::{MessageId, UserId};

/// Bounded set of recently seen message ids, oldest evicted first.
pub struct RecentIds {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id; returns `false` if it was already in the window.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Decides whether a bus event becomes a wire frame for one connection.
pub struct DeliveryFilter {
    user_id: UserId,
    recent: RecentIds,
}

impl DeliveryFilter {
    pub fn new(user_id: UserId, window: usize) -> Self {
        Self {
            user_id,
            recent: RecentIds::new(window),
        }
    }

    /// `true` if the event should be forwarded to this connection.
    ///
    /// `blocked` is the connection user's current block list, fetched by
    /// the caller from the block-list collaborator.
    pub fn should_forward(&mut self, event: &BusEvent, blocked: &HashSet<UserId>) -> bool {
        match event {
            BusEvent::MessageNew(record) => {
                if record.sender == self.user_id {
                    // Own echo; the pipeline ack already confirmed it.
                    return false;
                }
                if blocked.contains(&record.sender) {
                    return false;
                }
                self.recent.insert(record.id)
            }
            BusEvent::MessageUpdated(record) => {
                record.sender != self.user_id && !blocked.contains(&record.sender)
            }
            BusEvent::MessageDeleted { .. } => true,
            BusEvent::DeliveryChanged { user_id, .. } => {
                // A recipient does not need its own ack mirrored back.
                *user_id != self.user_id
            }
            BusEvent::PresenceChanged { user_id, .. } => *user_id != self.user_id,
            BusEvent::TypingChanged { user_id, .. } => {
                *user_id != self.user_id && !blocked.contains(user_id)
            }
        }
    }
}
