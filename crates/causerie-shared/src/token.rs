//! Connect tokens issued by the external identity service.
//!
//! A token binds a user public key to an expiry and a permission set, signed
//! by the identity service's Ed25519 key. The chat engine only verifies; it
//! never issues identities.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Permissions granted by the identity service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// Send/edit/delete own messages, ack deliveries.
    Chat,
    /// Administer conversations the user is an admin of.
    ManageConversations,
}

// Token signed by the identity service, presented by the client as the
// first WebSocket frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectToken {
    pub user_pubkey: [u8; 32],
    pub permissions: Vec<Permission>,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl ConnectToken {
    pub fn user_id(&self) -> UserId {
        UserId(self.user_pubkey)
    }

    /// The signed payload: `user_pubkey || permissions (json) || valid_until (rfc3339)`.
    fn signing_payload(&self) -> Vec<u8> {
        signing_payload(&self.user_pubkey, &self.permissions, self.valid_until)
    }
}

fn signing_payload(
    user_pubkey: &[u8; 32],
    permissions: &[Permission],
    valid_until: DateTime<Utc>,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_pubkey);
    // Permission list is part of the signature; serde_json on a slice of
    // unit variants is deterministic.
    payload.extend_from_slice(
        serde_json::to_string(permissions)
            .unwrap_or_default()
            .as_bytes(),
    );
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

/// Verify a token against the identity service's public key.
///
/// Returns `false` on expiry, malformed key/signature, or signature mismatch.
pub fn verify_connect_token(token: &ConnectToken, service_pubkey: &[u8; 32]) -> bool {
    if Utc::now() > token.valid_until {
        return false;
    }

    let Ok(verifying_key) = VerifyingKey::from_bytes(service_pubkey) else {
        return false;
    };

    let Ok(signature) = Signature::from_slice(&token.signature) else {
        return false;
    };

    verifying_key
        .verify(&token.signing_payload(), &signature)
        .is_ok()
}

/// Issue a signed token. Lives here so tests and the identity service share
/// one payload definition; the engine itself never calls this in production.
pub fn create_connect_token(
    user_pubkey: &[u8; 32],
    permissions: Vec<Permission>,
    valid_until: DateTime<Utc>,
    service_signing_key: &ed25519_dalek::SigningKey,
) -> ConnectToken {
    use ed25519_dalek::Signer;

    let payload = signing_payload(user_pubkey, &permissions, valid_until);
    let signature = service_signing_key.sign(&payload);

    ConnectToken {
        user_pubkey: *user_pubkey,
        permissions,
        valid_until,
        signature: signature.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn service_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn valid_token_verifies() {
        let key = service_key();
        let token = create_connect_token(
            &[1u8; 32],
            vec![Permission::Chat],
            Utc::now() + Duration::hours(1),
            &key,
        );
        assert!(verify_connect_token(
            &token,
            key.verifying_key().as_bytes()
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = service_key();
        let token = create_connect_token(
            &[1u8; 32],
            vec![Permission::Chat],
            Utc::now() - Duration::minutes(1),
            &key,
        );
        assert!(!verify_connect_token(
            &token,
            key.verifying_key().as_bytes()
        ));
    }

    #[test]
    fn wrong_service_key_is_rejected() {
        let key = service_key();
        let other = service_key();
        let token = create_connect_token(
            &[1u8; 32],
            vec![Permission::Chat],
            Utc::now() + Duration::hours(1),
            &key,
        );
        assert!(!verify_connect_token(
            &token,
            other.verifying_key().as_bytes()
        ));
    }

    #[test]
    fn tampered_permissions_break_the_signature() {
        let key = service_key();
        let mut token = create_connect_token(
            &[1u8; 32],
            vec![Permission::Chat],
            Utc::now() + Duration::hours(1),
            &key,
        );
        token.permissions.push(Permission::ManageConversations);
        assert!(!verify_connect_token(
            &token,
            key.verifying_key().as_bytes()
        ));
    }
}
