//! Session registry: which connections are live for which user.
//!
//! Multi-device is the norm, not the exception: a user may hold any number
//! of concurrent sessions, and removing one leaves the rest untouched.
//! `unregister` of an unknown id is a no-op because disconnect races are
//! expected, never an error.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use causerie_shared::protocol::ServerEvent;
use causerie_shared::types::{SessionId, UserId};

/// Outbound channel into one connection's write pump.
pub type SessionHandle = mpsc::Sender<ServerEvent>;

struct SessionEntry {
    user_id: UserId,
    handle: SessionHandle,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
}

/// Exclusive owner of session lifecycle.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection for a user. Returns the new session id.
    pub async fn register(&self, user_id: UserId, handle: SessionHandle) -> SessionId {
        let session_id = SessionId::new();
        let mut inner = self.inner.write().await;

        inner
            .sessions
            .insert(session_id, SessionEntry { user_id, handle });
        inner
            .by_user
            .entry(user_id)
            .or_default()
            .insert(session_id);

        debug!(user = %user_id.short(), session = %session_id, "session registered");
        session_id
    }

    /// Remove a session. Unknown ids are ignored; returns the user the
    /// session belonged to, if it existed.
    pub async fn unregister(&self, session_id: SessionId) -> Option<UserId> {
        let mut inner = self.inner.write().await;

        let entry = inner.sessions.remove(&session_id)?;
        if let Some(set) = inner.by_user.get_mut(&entry.user_id) {
            set.remove(&session_id);
            if set.is_empty() {
                inner.by_user.remove(&entry.user_id);
            }
        }

        debug!(user = %entry.user_id.short(), session = %session_id, "session unregistered");
        Some(entry.user_id)
    }

    /// Handles of every live session for a user. Empty means offline.
    pub async fn sessions_for(&self, user_id: UserId) -> Vec<SessionHandle> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_user.get(&user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Number of live sessions for a user.
    pub async fn session_count(&self, user_id: UserId) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Total live sessions across all users.
    pub async fn total_sessions(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
