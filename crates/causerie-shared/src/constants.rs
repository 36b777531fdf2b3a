/// Protocol version string reported in the `ready` handshake.
pub const PROTOCOL_VERSION: &str = "/causerie/1.0.0";

/// Application name
pub const APP_NAME: &str = "Causerie";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Maximum encrypted message content size in bytes (64 KiB)
pub const MAX_CONTENT_SIZE: usize = 65_536;

/// Reserved distribution-bus topic for presence events.
pub const PRESENCE_TOPIC: &str = "presence";

/// How many recently delivered message ids each connection remembers for
/// duplicate suppression.
pub const DEDUP_WINDOW: usize = 128;

/// Default grace delay before a user with no remaining sessions is
/// announced offline (seconds).
pub const DEFAULT_PRESENCE_GRACE_SECS: u64 = 30;

/// How long a client has to authenticate after the socket opens (seconds).
pub const AUTH_TIMEOUT_SECS: u64 = 10;

/// Publish retry policy after a durable append: attempts and base delay.
pub const PUBLISH_RETRY_ATTEMPTS: u32 = 3;
pub const PUBLISH_RETRY_BASE_MS: u64 = 50;

/// Default page size for history fetches, and the hard ceiling.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Default HTTP listen port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
