//! # causerie-core
//!
//! The chat engine core: session registry, presence tracking, and the
//! message pipeline (validate → persist → publish), plus the collaborator
//! traits for the external services the engine consumes (identity,
//! key-exchange, block lists, object storage).
//!
//! The core never sees plaintext: message content enters and leaves as an
//! opaque ciphertext blob with its encryption metadata attached.

pub mod collab;
pub mod filter;
pub mod pipeline;
pub mod presence;
pub mod registry;
pub mod store;

pub use pipeline::{InboundMessage, MessagePipeline, PipelineError};
pub use presence::PresenceTracker;
pub use registry::{SessionHandle, SessionRegistry};
pub use store::SharedStore;
