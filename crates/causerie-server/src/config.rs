//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development. The all-zeros auth key accepts nothing, so a dev
//! instance still needs AUTH_PUBKEY before real clients can connect.

use std::net::SocketAddr;
use std::path::PathBuf;

use causerie_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_PRESENCE_GRACE_SECS};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database path. When unset, a platform data directory is used.
    /// Env: `DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Ed25519 public key of the identity service (hex, 64 chars).
    /// Env: `AUTH_PUBKEY`
    /// Default: all-zeros (rejects every token).
    pub auth_pubkey: [u8; 32],

    /// Seconds a user stays online after their last session drops.
    /// Env: `PRESENCE_GRACE_SECS`
    /// Default: `30`
    pub presence_grace_secs: u64,

    /// Maximum concurrent WebSocket sessions (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,

    /// Human-readable name for this instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Causerie"`
    pub instance_name: String,

    /// Base URL handed to clients for encrypted file uploads.
    /// Env: `UPLOAD_BASE_URL`
    /// Default: `http://localhost:8080/uploads`
    pub upload_base_url: String,

    /// Maximum declared upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 50 MiB
    pub max_upload_size: u64,

    /// Per-IP budget refill rate, in request-cost units per second.
    /// Env: `THROTTLE_PER_SEC`
    /// Default: `10`
    pub throttle_per_sec: f64,

    /// Per-IP budget ceiling, in request-cost units.
    /// Env: `THROTTLE_BURST`
    /// Default: `30`
    pub throttle_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            db_path: None,
            auth_pubkey: [0u8; 32],
            presence_grace_secs: DEFAULT_PRESENCE_GRACE_SECS,
            max_connections: 0,
            instance_name: "Causerie".to_string(),
            upload_base_url: "http://localhost:8080/uploads".to_string(),
            max_upload_size: 50 * 1024 * 1024,
            throttle_per_sec: 10.0,
            throttle_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(hex_key) = std::env::var("AUTH_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.auth_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid AUTH_PUBKEY, keeping all-zeros (rejects every token)"
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("PRESENCE_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.presence_grace_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("MAX_CONNECTIONS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_connections = n;
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(url) = std::env::var("UPLOAD_BASE_URL") {
            config.upload_base_url = url;
        }

        if let Ok(val) = std::env::var("MAX_UPLOAD_SIZE") {
            if let Ok(n) = val.parse::<u64>() {
                config.max_upload_size = n;
            }
        }

        if let Ok(val) = std::env::var("THROTTLE_PER_SEC") {
            if let Ok(n) = val.parse::<f64>() {
                config.throttle_per_sec = n;
            }
        }

        if let Ok(val) = std::env::var("THROTTLE_BURST") {
            if let Ok(n) = val.parse::<f64>() {
                config.throttle_burst = n;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Parse a 64-character hex string into a 32-byte key.
pub fn parse_hex_pubkey(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
