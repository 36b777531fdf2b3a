//! Connect-token verification and caching.
//!
//! Clients present a base64-encoded JSON [`ConnectToken`] as their first
//! WebSocket frame. Verification checks the identity service's Ed25519
//! signature; successful results are cached by token string so reconnect
//! storms do not re-run signature checks.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use causerie_core::collab::{AuthContext, AuthError, Authenticator};
use causerie_shared::token::{verify_connect_token, ConnectToken};

struct CachedAuth {
    context: AuthContext,
    valid_until: DateTime<Utc>,
}

impl CachedAuth {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.valid_until
    }
}

/// Verifies connect tokens against the identity service's public key.
pub struct TokenAuthenticator {
    service_pubkey: [u8; 32],
    cache: RwLock<HashMap<String, CachedAuth>>,
}

impl TokenAuthenticator {
    pub fn new(service_pubkey: [u8; 32]) -> Self {
        Self {
            service_pubkey,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn decode(token: &str) -> Result<ConnectToken, AuthError> {
        let raw = BASE64_STANDARD
            .decode(token.trim().as_bytes())
            .map_err(|e| AuthError::Unauthenticated(format!("token is not base64: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| AuthError::Unauthenticated(format!("malformed token: {e}")))
    }

    /// Evict expired entries. Run periodically from the server main loop.
    pub fn purge_expired(&self) {
        let mut cache = self.cache.write().expect("auth cache lock");
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged expired auth cache entries");
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        {
            let cache = self.cache.read().expect("auth cache lock");
            if let Some(entry) = cache.get(token) {
                if entry.is_fresh() {
                    debug!(
                        user = %entry.context.user_id.to_hex(),
                        "Auth served from cache"
                    );
                    return Ok(entry.context.clone());
                }
            }
        }

        let parsed = Self::decode(token)?;
        if !verify_connect_token(&parsed, &self.service_pubkey) {
            return Err(AuthError::Unauthenticated(
                "signature invalid or token expired".into(),
            ));
        }

        let context = AuthContext {
            user_id: parsed.user_id(),
            permissions: parsed.permissions.clone(),
        };

        {
            let mut cache = self.cache.write().expect("auth cache lock");
            cache.insert(
                token.to_string(),
                CachedAuth {
                    context: context.clone(),
                    valid_until: parsed.valid_until,
                },
            );
        }

        info!(
            user = %context.user_id.to_hex(),
            until = %parsed.valid_until,
            "Connect token verified"
        );

        Ok(context)
    }
}

/// Encode a token the way clients put it on the wire. Shared with tests.
pub fn encode_token(token: &ConnectToken) -> String {
    BASE64_STANDARD.encode(serde_json::to_vec(token).expect("token serializes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use causerie_shared::token::{create_connect_token, Permission};

    fn issue(key: &SigningKey, hours: i64) -> String {
        let token = create_connect_token(
            &[7u8; 32],
            vec![Permission::Chat],
            Utc::now() + Duration::hours(hours),
            key,
        );
        encode_token(&token)
    }

    #[test]
    fn valid_token_yields_context() {
        let key = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(key.verifying_key().to_bytes());

        let context = auth.verify(&issue(&key, 1)).unwrap();
        assert_eq!(context.user_id.0, [7u8; 32]);
        assert!(context.has(Permission::Chat));
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(key.verifying_key().to_bytes());
        assert!(auth.verify(&issue(&key, -1)).is_err());
    }

    #[test]
    fn wrong_service_key_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(other.verifying_key().to_bytes());
        assert!(auth.verify(&issue(&key, 1)).is_err());
    }

    #[test]
    fn garbage_is_rejected_not_panicked() {
        let auth = TokenAuthenticator::new([0u8; 32]);
        assert!(auth.verify("not-base64!!").is_err());
        assert!(auth
            .verify(&BASE64_STANDARD.encode(b"{\"not\": \"a token\"}"))
            .is_err());
    }

    // The seam the engine exposes must carry the permission type; the
    // handshake checks `Permission::Chat` through it.
    #[test]
    fn permissions_resolve_through_the_collab_seam() {
        let context = AuthContext {
            user_id: causerie_shared::types::UserId([7u8; 32]),
            permissions: vec![causerie_core::collab::Permission::Chat],
        };
        assert!(context.has(causerie_core::collab::Permission::Chat));
        assert!(!context.has(causerie_core::collab::Permission::ManageConversations));
    }

    #[test]
    fn second_verify_hits_the_cache() {
        let key = SigningKey::generate(&mut OsRng);
        let auth = TokenAuthenticator::new(key.verifying_key().to_bytes());
        let token = issue(&key, 1);

        auth.verify(&token).unwrap();
        assert_eq!(auth.cache.read().unwrap().len(), 1);
        auth.verify(&token).unwrap();

        auth.purge_expired();
        assert_eq!(auth.cache.read().unwrap().len(), 1);
    }
}
