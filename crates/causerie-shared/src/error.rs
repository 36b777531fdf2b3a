use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal rejection reasons surfaced to clients.
///
/// Duplicate bus delivery is deliberately absent: duplicates are absorbed
/// idempotently and never reported as errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Error)]
#[serde(rename_all = "kebab-case")]
pub enum RejectKind {
    /// Malformed or oversized input. Not retried.
    #[error("invalid message")]
    InvalidMessage,

    /// Identity could not be established.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Identity is known but lacks permission for the operation.
    #[error("forbidden")]
    Forbidden,

    /// The referenced entity does not exist.
    #[error("not found")]
    NotFound,

    /// The store was unavailable; nothing was published. Safe to retry.
    #[error("persistence failure")]
    PersistenceFailure,

    /// The bus was unavailable after the message was durably appended.
    /// Live fan-out degrades to catch-up via history fetch.
    #[error("distribution failure")]
    DistributionFailure,
}
