//! Collaborator traits for the external services the engine consumes.
//!
//! Identity issuance, key exchange, block lists, and object storage all
//! live outside this system; the engine sees them only through these
//! seams. Production implementations live in the server crate, test
//! doubles next to the tests that need them.

use std::collections::HashSet;

use thiserror::Error;

pub use causerie_shared::token::Permission;

use causerie_shared::types::{EncryptionMetadata, UserId};

/// A verified principal, as handed back by the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub permissions: Vec<Permission>,
}

impl AuthContext {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

/// Verifies a connect token presented by a client.
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Validates the encryption metadata attached to a message. The engine
/// persists and relays the metadata unchanged; it only gets a shape check.
pub trait KeyExchange: Send + Sync {
    fn validate(&self, metadata: &EncryptionMetadata) -> bool;
}

/// Structural validation only: every field present, nothing decrypted.
#[derive(Default)]
pub struct StructuralKeyExchange;

impl KeyExchange for StructuralKeyExchange {
    fn validate(&self, metadata: &EncryptionMetadata) -> bool {
        !metadata.algorithm.is_empty() && !metadata.iv.is_empty() && !metadata.key_ref.is_empty()
    }
}

/// Who has this user blocked. Read at fan-out time; events from blocked
/// senders are dropped before they reach the wire.
pub trait BlockListProvider: Send + Sync {
    fn blocked_by(&self, user_id: UserId) -> HashSet<UserId>;
}

/// In-memory block list; the admin surface populates it.
#[derive(Default)]
pub struct StaticBlockList {
    entries: std::sync::RwLock<std::collections::HashMap<UserId, HashSet<UserId>>>,
}

impl StaticBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, user: UserId, blocked: UserId) {
        self.entries
            .write()
            .expect("block list lock")
            .entry(user)
            .or_default()
            .insert(blocked);
    }

    pub fn unblock(&self, user: UserId, blocked: UserId) {
        if let Some(set) = self
            .entries
            .write()
            .expect("block list lock")
            .get_mut(&user)
        {
            set.remove(&blocked);
        }
    }
}

impl BlockListProvider for StaticBlockList {
    fn blocked_by(&self, user_id: UserId) -> HashSet<UserId> {
        self.entries
            .read()
            .expect("block list lock")
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// File metadata the client supplies when asking where to upload.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// Where the client should upload, and the reference the engine stores.
/// File bytes never pass through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Opaque reference persisted alongside the message metadata.
    pub reference: String,
    /// Where the client PUTs the encrypted file.
    pub upload_url: String,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
}

pub trait UploadTargetProvider: Send + Sync {
    fn request_upload_target(&self, metadata: &UploadMetadata) -> Result<UploadTarget, UploadError>;
}
