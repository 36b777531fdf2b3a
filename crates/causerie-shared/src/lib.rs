//! # causerie-shared
//!
//! Types shared between the chat engine crates: identifiers, the
//! client-facing wire protocol, distribution-bus events, the rejection
//! taxonomy, and protocol constants.
//!
//! Message content is always an opaque ciphertext blob end to end; nothing
//! in this crate (or the engine) can decrypt it.

pub mod constants;
pub mod error;
pub mod events;
pub mod protocol;
pub mod token;
pub mod types;

pub use error::RejectKind;
pub use types::{ConversationId, MessageId, SessionId, UserId};
