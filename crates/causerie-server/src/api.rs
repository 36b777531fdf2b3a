use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap, Method},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use causerie_bus::DistributionBus;
use causerie_core::collab::{
    AuthContext, Authenticator, BlockListProvider, Permission, UploadTargetProvider,
};
use causerie_core::{MessagePipeline, PresenceTracker, SessionRegistry, SharedStore};

use crate::config::ServerConfig;
use crate::connection;
use crate::error::ServerError;
use crate::rate_limit::{throttle_middleware, Throttle};

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub bus: Arc<dyn DistributionBus>,
    pub pipeline: Arc<MessagePipeline>,
    pub registry: Arc<SessionRegistry>,
    pub presence: PresenceTracker,
    pub authenticator: Arc<dyn Authenticator>,
    pub block_list: Arc<dyn BlockListProvider>,
    pub uploads: Arc<dyn UploadTargetProvider>,
    pub throttle: Arc<Throttle>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_upgrade))
        .route("/uploads", post(request_upload))
        .layer(middleware::from_fn_with_state(
            state.throttle.clone(),
            throttle_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    max_connections: usize,
    active_sessions: usize,
}

#[derive(Deserialize)]
struct UploadRequest {
    file_name: String,
    size_bytes: u64,
    mime_type: String,
}

#[derive(Serialize)]
struct UploadResponse {
    reference: String,
    upload_url: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: causerie_shared::constants::PROTOCOL_VERSION,
        max_connections: state.config.max_connections,
        active_sessions: state.registry.total_sessions().await,
    })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| connection::run(state, socket))
}

/// Issue an upload target for an encrypted attachment. The file bytes never
/// pass through this server. Callers present the same connect token the
/// WebSocket handshake takes, as a bearer credential.
async fn request_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ServerError> {
    let context = bearer_auth(state.authenticator.as_ref(), &headers)?;

    let metadata = causerie_core::collab::UploadMetadata {
        file_name: req.file_name,
        size_bytes: req.size_bytes,
        mime_type: req.mime_type,
    };
    let target = state.uploads.request_upload_target(&metadata)?;

    info!(
        user = %context.user_id.short(),
        reference = %target.reference,
        size = metadata.size_bytes,
        "Upload target issued"
    );

    Ok(Json(UploadResponse {
        reference: target.reference,
        upload_url: target.upload_url,
    }))
}

/// Verify an `Authorization: Bearer <connect-token>` header.
fn bearer_auth(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
) -> Result<AuthContext, ServerError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServerError::Unauthorized("missing bearer token".into()))?;

    let context = authenticator
        .verify(token)
        .map_err(|e| ServerError::Unauthorized(e.to_string()))?;

    if !context.has(Permission::Chat) {
        return Err(ServerError::Forbidden("chat permission required".into()));
    }
    Ok(context)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP/WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::{Duration, Utc};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use causerie_shared::token::create_connect_token;

    use crate::auth::{encode_token, TokenAuthenticator};

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn upload_auth_accepts_a_valid_bearer_token() {
        let key = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(key.verifying_key().to_bytes());
        let token = create_connect_token(
            &[7u8; 32],
            vec![Permission::Chat],
            Utc::now() + Duration::hours(1),
            &key,
        );

        let context = bearer_auth(&auth, &bearer_headers(&encode_token(&token))).unwrap();
        assert_eq!(context.user_id.0, [7u8; 32]);
    }

    #[test]
    fn upload_auth_rejects_a_missing_header() {
        let auth = TokenAuthenticator::new([0u8; 32]);
        assert!(matches!(
            bearer_auth(&auth, &HeaderMap::new()),
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[test]
    fn upload_auth_rejects_a_forged_token() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(other.verifying_key().to_bytes());
        let token = create_connect_token(
            &[7u8; 32],
            vec![Permission::Chat],
            Utc::now() + Duration::hours(1),
            &key,
        );

        assert!(matches!(
            bearer_auth(&auth, &bearer_headers(&encode_token(&token))),
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[test]
    fn upload_auth_requires_chat_permission() {
        let key = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(key.verifying_key().to_bytes());
        let token = create_connect_token(
            &[7u8; 32],
            vec![Permission::ManageConversations],
            Utc::now() + Duration::hours(1),
            &key,
        );

        assert!(matches!(
            bearer_auth(&auth, &bearer_headers(&encode_token(&token))),
            Err(ServerError::Forbidden(_))
        ));
    }
}
