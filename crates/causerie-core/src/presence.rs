//! Presence tracking derived from session registry events.
//!
//! Presence is ephemeral, process-wide state; the registry stays the source
//! of truth for liveness. The one subtlety is the grace delay: when a
//! user's last session drops, the offline announcement is deferred so a
//! quick reconnect never flaps presence. Cancellation uses a per-user
//! generation counter: any state change bumps it, and a pending offline
//! task only fires if its generation is still current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use causerie_bus::DistributionBus;
use causerie_shared::constants::PRESENCE_TOPIC;
use causerie_shared::events::BusEvent;
use causerie_shared::types::{PresenceStatus, UserId};

use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy)]
struct PresenceEntry {
    status: PresenceStatus,
    /// Bumped on every state change; stale grace timers check it and bail.
    generation: u64,
}

#[derive(Clone)]
pub struct PresenceTracker {
    entries: Arc<Mutex<HashMap<UserId, PresenceEntry>>>,
    registry: Arc<SessionRegistry>,
    bus: Arc<dyn DistributionBus>,
    grace: Duration,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: Arc<dyn DistributionBus>,
        grace: Duration,
    ) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            registry,
            bus,
            grace,
        }
    }

    /// Current status for a user; unknown users are offline.
    pub async fn snapshot(&self, user_id: UserId) -> PresenceStatus {
        self.entries
            .lock()
            .await
            .get(&user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// A session came up. Emits exactly one presence event per
    /// offline→online edge; additional devices are silent.
    pub async fn on_session_registered(&self, user_id: UserId) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(user_id).or_insert(PresenceEntry {
            status: PresenceStatus::Offline,
            generation: 0,
        });

        // Any registration invalidates a pending offline timer.
        entry.generation += 1;

        if entry.status == PresenceStatus::Offline {
            entry.status = PresenceStatus::Online;
            drop(entries);
            self.announce(user_id, PresenceStatus::Online);
        }
    }

    /// A session went away. If it was the user's last, start the grace
    /// timer; a reconnect within the window suppresses the flap entirely.
    pub async fn on_session_unregistered(&self, user_id: UserId) {
        if self.registry.session_count(user_id).await > 0 {
            return;
        }

        let generation = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&user_id) else {
                return;
            };
            entry.generation += 1;
            entry.generation
        };

        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.grace).await;
            tracker.finish_offline(user_id, generation).await;
        });
    }

    async fn finish_offline(&self, user_id: UserId, generation: u64) {
        // Re-check liveness after the grace window.
        if self.registry.session_count(user_id).await > 0 {
            return;
        }

        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&user_id) else {
            return;
        };
        if entry.generation != generation {
            // Something happened in the meantime; that change owns the
            // announcement now.
            debug!(user = %user_id.short(), "stale offline timer discarded");
            return;
        }
        if entry.status == PresenceStatus::Offline {
            return;
        }

        entry.status = PresenceStatus::Offline;
        drop(entries);
        self.announce(user_id, PresenceStatus::Offline);
    }

    /// Explicit status change (away/online). Always immediate; announcing
    /// the current status again is a no-op.
    pub async fn set_status(&self, user_id: UserId, status: PresenceStatus) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(user_id).or_insert(PresenceEntry {
            status: PresenceStatus::Offline,
            generation: 0,
        });

        if entry.status == status {
            return;
        }

        entry.status = status;
        entry.generation += 1;
        drop(entries);
        self.announce(user_id, status);
    }

    fn announce(&self, user_id: UserId, status: PresenceStatus) {
        let event = BusEvent::PresenceChanged {
            user_id,
            status,
            at: Utc::now(),
        };
        match event.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(PRESENCE_TOPIC, bytes.into()) {
                    // Presence is ephemeral; the next transition rebroadcasts.
                    warn!(user = %user_id.short(), error = %e, "presence publish failed");
                }
            }
            Err(e) => warn!(error = %e, "presence event serialization failed"),
        }
        debug!(user = %user_id.short(), status = ?status, "presence changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use causerie_bus::InProcessBus;
    use causerie_shared::protocol::ServerEvent;
    use tokio::sync::mpsc;

    fn user(n: u8) -> UserId {
        UserId([n; 32])
    }

    fn handle() -> mpsc::Sender<ServerEvent> {
        mpsc::channel(8).0
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        tracker: PresenceTracker,
        presence_sub: causerie_bus::Subscription,
    }

    fn fixture(grace: Duration) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let bus: Arc<dyn DistributionBus> = Arc::new(InProcessBus::new());
        let presence_sub = bus.subscribe(PRESENCE_TOPIC);
        let tracker = PresenceTracker::new(registry.clone(), bus, grace);
        Fixture {
            registry,
            tracker,
            presence_sub,
        }
    }

    async fn next_presence(sub: &mut causerie_bus::Subscription) -> (UserId, PresenceStatus) {
        let bytes = sub.recv().await.unwrap();
        match BusEvent::from_bytes(&bytes).unwrap() {
            BusEvent::PresenceChanged {
                user_id, status, ..
            } => (user_id, status),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_session_announces_online_once() {
        let mut fx = fixture(Duration::from_secs(30));

        fx.registry.register(user(1), handle()).await;
        fx.tracker.on_session_registered(user(1)).await;

        // Second device: no second announcement.
        fx.registry.register(user(1), handle()).await;
        fx.tracker.on_session_registered(user(1)).await;

        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Online)
        );
        // Nothing else queued: a set_status probe arrives next.
        fx.tracker.set_status(user(1), PresenceStatus::Away).await;
        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Away)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_suppresses_offline() {
        let mut fx = fixture(Duration::from_secs(30));

        let s = fx.registry.register(user(1), handle()).await;
        fx.tracker.on_session_registered(user(1)).await;
        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Online)
        );

        // Disconnect, then reconnect well inside the grace window.
        fx.registry.unregister(s).await;
        fx.tracker.on_session_unregistered(user(1)).await;

        tokio::time::advance(Duration::from_secs(5)).await;

        fx.registry.register(user(1), handle()).await;
        fx.tracker.on_session_registered(user(1)).await;

        // Let the (stale) grace timer fire.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;

        assert_eq!(fx.tracker.snapshot(user(1)).await, PresenceStatus::Online);

        // No offline event was broadcast; the next observable event is a
        // deliberate probe.
        fx.tracker.set_status(user(1), PresenceStatus::Away).await;
        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Away)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn last_disconnect_goes_offline_after_grace() {
        let mut fx = fixture(Duration::from_secs(30));

        let s = fx.registry.register(user(1), handle()).await;
        fx.tracker.on_session_registered(user(1)).await;
        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Online)
        );

        fx.registry.unregister(s).await;
        fx.tracker.on_session_unregistered(user(1)).await;

        // Not yet offline inside the window.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fx.tracker.snapshot(user(1)).await, PresenceStatus::Online);

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Offline)
        );
        assert_eq!(fx.tracker.snapshot(user(1)).await, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn other_device_keeps_user_online() {
        let fx = fixture(Duration::from_millis(1));

        let s1 = fx.registry.register(user(1), handle()).await;
        fx.registry.register(user(1), handle()).await;
        fx.tracker.on_session_registered(user(1)).await;

        fx.registry.unregister(s1).await;
        fx.tracker.on_session_unregistered(user(1)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.tracker.snapshot(user(1)).await, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn redundant_set_status_is_deduplicated() {
        let mut fx = fixture(Duration::from_secs(30));

        fx.tracker.set_status(user(1), PresenceStatus::Away).await;
        fx.tracker.set_status(user(1), PresenceStatus::Away).await;
        fx.tracker.set_status(user(1), PresenceStatus::Online).await;

        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Away)
        );
        // The duplicate was swallowed; online comes straight after.
        assert_eq!(
            next_presence(&mut fx.presence_sub).await,
            (user(1), PresenceStatus::Online)
        );
    }
}
