//! # causerie-server
//!
//! Real-time chat engine server.
//!
//! This binary provides:
//! - **WebSocket sessions** (axum) speaking the JSON wire protocol:
//!   authenticate, send/edit/delete, delivery acks, typing, presence,
//!   history fetch
//! - **Durable message history** in SQLite with per-conversation ordering
//! - **In-process fan-out** over the distribution bus, one topic per
//!   conversation plus a reserved presence topic
//! - **Connect-token authentication** against an external identity service
//! - **Per-IP rate limiting** on the HTTP surface
//!
//! Message content is opaque ciphertext end to end; the server stores and
//! relays it without ever holding a decryption key.

mod api;
mod auth;
mod config;
mod connection;
mod error;
mod rate_limit;
mod uploads;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_bus::InProcessBus;
use causerie_core::collab::{StaticBlockList, StructuralKeyExchange};
use causerie_core::{MessagePipeline, PresenceTracker, SessionRegistry, SharedStore};
use causerie_store::Database;

use crate::api::AppState;
use crate::auth::TokenAuthenticator;
use crate::config::ServerConfig;
use crate::rate_limit::{Throttle, ThrottlePolicy};
use crate::uploads::StaticUploadTargets;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,causerie_server=debug")),
        )
        .init();

    info!("Starting Causerie server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // Storage: explicit DB_PATH or the platform data directory.
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Database ready");
    }
    let store = SharedStore::new(db);

    let bus = Arc::new(InProcessBus::new());
    let registry = Arc::new(SessionRegistry::new());
    let presence = PresenceTracker::new(
        registry.clone(),
        bus.clone(),
        Duration::from_secs(config.presence_grace_secs),
    );
    let pipeline = Arc::new(MessagePipeline::new(
        store.clone(),
        bus.clone(),
        Arc::new(StructuralKeyExchange),
    ));

    let authenticator = Arc::new(TokenAuthenticator::new(config.auth_pubkey));
    let block_list = Arc::new(StaticBlockList::new());
    let uploads = Arc::new(StaticUploadTargets::new(
        config.upload_base_url.clone(),
        config.max_upload_size,
    ));
    let throttle = Arc::new(Throttle::new(ThrottlePolicy {
        per_sec: config.throttle_per_sec,
        burst: config.throttle_burst,
    }));

    let app_state = AppState {
        store,
        bus,
        pipeline,
        registry,
        presence,
        authenticator: authenticator.clone(),
        block_list,
        uploads,
        throttle: throttle.clone(),
        config: Arc::new(config.clone()),
    };

    // Periodic throttle cleanup (every 5 minutes, evict budgets idle >10 min).
    let sweep = throttle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            sweep.purge_stale(600.0);
        }
    });

    // Periodic auth cache cleanup (every 10 minutes).
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            authenticator.purge_expired();
        }
    });

    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
