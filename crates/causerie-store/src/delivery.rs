//! Per-recipient delivery-status records.
//!
//! Transitions are monotonic: `sent → delivered → read`, forward skips
//! allowed (a `read` ack may arrive before `delivered` was ever recorded),
//! regressions silently ignored. Redundant ack paths therefore cannot
//! corrupt state.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use causerie_shared::types::{DeliveryState, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::DeliveryStatus;

/// Outcome of [`Database::record_delivery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// The status now on record.
    pub status: DeliveryState,
    /// Whether this call advanced it. `false` means the ack was stale or a
    /// duplicate and was absorbed as a no-op.
    pub advanced: bool,
}

impl Database {
    /// Record a delivery status for one recipient of one message.
    ///
    /// Fails with [`StoreError::NotFound`] if the message does not exist.
    /// A status at or below the current one is a silent no-op.
    pub fn record_delivery(
        &mut self,
        message_id: MessageId,
        user_id: UserId,
        status: DeliveryState,
    ) -> Result<DeliveryOutcome> {
        let tx = self.conn_mut().transaction()?;

        let message_exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![message_id.0.to_string()],
            |row| row.get(0),
        )?;
        if message_exists == 0 {
            return Err(StoreError::NotFound);
        }

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM delivery_status
                 WHERE message_id = ?1 AND user_id = ?2",
                params![message_id.0.to_string(), user_id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match current {
            None => {
                tx.execute(
                    "INSERT INTO delivery_status (message_id, user_id, status, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message_id.0.to_string(),
                        user_id.to_hex(),
                        status.as_str(),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                DeliveryOutcome {
                    status,
                    advanced: true,
                }
            }
            Some(current_str) => {
                let current_state = DeliveryState::parse(&current_str).ok_or_else(|| {
                    StoreError::Invariant(format!("unknown delivery status: {current_str}"))
                })?;

                if status > current_state {
                    tx.execute(
                        "UPDATE delivery_status SET status = ?3, updated_at = ?4
                         WHERE message_id = ?1 AND user_id = ?2",
                        params![
                            message_id.0.to_string(),
                            user_id.to_hex(),
                            status.as_str(),
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                    DeliveryOutcome {
                        status,
                        advanced: true,
                    }
                } else {
                    DeliveryOutcome {
                        status: current_state,
                        advanced: false,
                    }
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// All delivery records for one message.
    pub fn delivery_for_message(&self, message_id: MessageId) -> Result<Vec<DeliveryStatus>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, user_id, status, updated_at
             FROM delivery_status
             WHERE message_id = ?1
             ORDER BY user_id ASC",
        )?;

        let rows = stmt.query_map(params![message_id.0.to_string()], row_to_status)?;

        let mut statuses = Vec::new();
        for row in rows {
            statuses.push(row?);
        }
        Ok(statuses)
    }
}

fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryStatus> {
    let message_str: String = row.get(0)?;
    let user_hex: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let updated_str: String = row.get(3)?;

    let message_id = Uuid::parse_str(&message_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let user_id = UserId::from_hex(&user_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = DeliveryState::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown delivery status: {status_str}").into(),
        )
    })?;
    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(DeliveryStatus {
        message_id: MessageId(message_id),
        user_id,
        status,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::types::{ContentType, ConversationId, EncryptionMetadata};

    use crate::models::NewMessage;

    fn user(n: u8) -> UserId {
        UserId([n; 32])
    }

    fn seeded_message(db: &mut Database) -> MessageId {
        let c = db.create_direct_conversation(user(1), user(2)).unwrap();
        db.append_message(&NewMessage {
            id: MessageId::new(),
            conversation_id: c.id,
            sender: user(1),
            encrypted_content: b"x".to_vec(),
            content_type: ContentType::Text,
            encryption: EncryptionMetadata {
                algorithm: "xchacha20poly1305".into(),
                iv: vec![0u8; 24],
                key_ref: "kx/test".into(),
            },
            reply_to: None,
        })
        .unwrap()
        .id
    }

    #[test]
    fn status_advances_through_the_ladder() {
        let mut db = Database::open_in_memory().unwrap();
        let mid = seeded_message(&mut db);

        let o = db
            .record_delivery(mid, user(2), DeliveryState::Sent)
            .unwrap();
        assert!(o.advanced);

        let o = db
            .record_delivery(mid, user(2), DeliveryState::Delivered)
            .unwrap();
        assert_eq!(o.status, DeliveryState::Delivered);

        let o = db
            .record_delivery(mid, user(2), DeliveryState::Read)
            .unwrap();
        assert_eq!(o.status, DeliveryState::Read);
    }

    #[test]
    fn status_never_regresses() {
        let mut db = Database::open_in_memory().unwrap();
        let mid = seeded_message(&mut db);

        db.record_delivery(mid, user(2), DeliveryState::Read).unwrap();

        // A late `delivered` from a redundant path is absorbed silently.
        let o = db
            .record_delivery(mid, user(2), DeliveryState::Delivered)
            .unwrap();
        assert!(!o.advanced);
        assert_eq!(o.status, DeliveryState::Read);

        let rows = db.delivery_for_message(mid).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryState::Read);
    }

    #[test]
    fn forward_skip_is_permitted() {
        let mut db = Database::open_in_memory().unwrap();
        let mid = seeded_message(&mut db);

        // `read` before `delivered` was ever recorded jumps straight there.
        let o = db
            .record_delivery(mid, user(2), DeliveryState::Read)
            .unwrap();
        assert!(o.advanced);
        assert_eq!(o.status, DeliveryState::Read);
    }

    #[test]
    fn duplicate_ack_is_a_noop() {
        let mut db = Database::open_in_memory().unwrap();
        let mid = seeded_message(&mut db);

        db.record_delivery(mid, user(2), DeliveryState::Delivered)
            .unwrap();
        let o = db
            .record_delivery(mid, user(2), DeliveryState::Delivered)
            .unwrap();
        assert!(!o.advanced);
    }

    #[test]
    fn unknown_message_is_not_found() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .record_delivery(MessageId::new(), user(2), DeliveryState::Read)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn rows_are_per_recipient() {
        let mut db = Database::open_in_memory().unwrap();
        let mid = seeded_message(&mut db);

        db.record_delivery(mid, user(2), DeliveryState::Read).unwrap();
        db.record_delivery(mid, user(3), DeliveryState::Delivered)
            .unwrap();

        assert_eq!(db.delivery_for_message(mid).unwrap().len(), 2);
    }
}
