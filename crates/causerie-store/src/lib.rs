//! # causerie-store
//!
//! Durable, ordered persistence for the chat engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for every domain model. The
//! load-bearing guarantee lives in [`messages`]: every append assigns a
//! per-conversation sequence atomically with the insert, and that sequence
//! is the authoritative message order regardless of wall clocks.

pub mod conversations;
pub mod database;
pub mod delivery;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
