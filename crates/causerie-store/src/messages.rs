//! Message persistence: append with per-conversation sequence assignment,
//! edit, tombstone deletion, and cursor pagination.
//!
//! The sequence is assigned inside the same transaction as the insert, so
//! within a conversation it is gapless at assignment time and strictly
//! monotonic: if one append returns before another starts, the earlier one
//! holds the smaller sequence. Wall-clock timestamps never participate in
//! ordering.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use causerie_shared::events::MessageRecord;
use causerie_shared::types::{
    ContentType, ConversationId, EncryptionMetadata, MessageId, UserId,
};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{MessagePage, NewMessage};

impl Database {
    /// Durably append a message, assigning its sequence position.
    ///
    /// The transaction reads `MAX(seq)` and inserts in one atomic step; the
    /// `UNIQUE(conversation_id, seq)` constraint backstops the invariant.
    /// Fails with [`StoreError::NotFound`] if the conversation is unknown.
    pub fn append_message(&mut self, new: &NewMessage) -> Result<MessageRecord> {
        let tx = self.conn_mut().transaction()?;

        let conversation_exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversations WHERE id = ?1",
            params![new.conversation_id.0.to_string()],
            |row| row.get(0),
        )?;
        if conversation_exists == 0 {
            return Err(StoreError::NotFound);
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![new.conversation_id.0.to_string()],
            |row| row.get(0),
        )?;

        let now = Utc::now();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, seq, sender, encrypted_content,
                                   content_type, enc_algorithm, enc_iv, enc_key_ref,
                                   reply_to, is_edited, is_deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, ?11, ?11)",
            params![
                new.id.0.to_string(),
                new.conversation_id.0.to_string(),
                seq,
                new.sender.to_hex(),
                new.encrypted_content,
                new.content_type.as_str(),
                new.encryption.algorithm,
                new.encryption.iv,
                new.encryption.key_ref,
                new.reply_to.map(|m| m.0.to_string()),
                now.to_rfc3339(),
            ],
        )?;

        tx.commit()?;

        Ok(MessageRecord {
            id: new.id,
            conversation_id: new.conversation_id,
            sequence: seq,
            sender: new.sender,
            encrypted_content: new.encrypted_content.clone(),
            content_type: new.content_type,
            encryption: new.encryption.clone(),
            reply_to: new.reply_to,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<MessageRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_record,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Replace a message's content. Only the original sender may edit, and
    /// only while the message is not tombstoned. Identity and sequence are
    /// preserved.
    pub fn edit_message(
        &self,
        message_id: MessageId,
        caller: UserId,
        new_content: &[u8],
    ) -> Result<MessageRecord> {
        let current = self.get_message(message_id)?;

        if current.is_deleted {
            // The content is gone; a tombstone cannot be edited.
            return Err(StoreError::NotFound);
        }
        if current.sender != caller {
            return Err(StoreError::Forbidden);
        }

        let now = Utc::now();
        self.conn().execute(
            "UPDATE messages
             SET encrypted_content = ?2, is_edited = 1, updated_at = ?3
             WHERE id = ?1",
            params![message_id.0.to_string(), new_content, now.to_rfc3339()],
        )?;

        Ok(MessageRecord {
            encrypted_content: new_content.to_vec(),
            is_edited: true,
            updated_at: now,
            ..current
        })
    }

    /// Tombstone a message: clear the content, set `is_deleted`, keep the
    /// row and its sequence slot. Idempotent.
    pub fn mark_message_deleted(&self, message_id: MessageId) -> Result<MessageRecord> {
        let current = self.get_message(message_id)?;
        if current.is_deleted {
            return Ok(current);
        }

        let now = Utc::now();
        self.conn().execute(
            "UPDATE messages
             SET encrypted_content = X'', is_deleted = 1, updated_at = ?2
             WHERE id = ?1",
            params![message_id.0.to_string(), now.to_rfc3339()],
        )?;

        Ok(MessageRecord {
            encrypted_content: Vec::new(),
            is_deleted: true,
            updated_at: now,
            ..current
        })
    }

    /// One page of history, newest first, bounded by `limit`.
    ///
    /// The cursor is opaque to callers and encodes the lowest sequence of
    /// the previous page; the next page strictly precedes it. Because pages
    /// are keyed by sequence rather than offset, concurrent appends ahead
    /// of the cursor never shift, duplicate, or drop a message.
    pub fn fetch_page(
        &self,
        conversation_id: ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage> {
        let before_seq = match cursor {
            Some(c) => decode_cursor(c)?,
            None => i64::MAX,
        };

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND seq < ?2
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), before_seq, limit],
            row_to_record,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        let next_cursor = if messages.len() == limit as usize {
            messages.last().map(|m| encode_cursor(m.sequence))
        } else {
            None
        };

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    /// Messages appended after a known sequence, oldest first. This is the
    /// reconnect gap-fill path.
    pub fn fetch_since(
        &self,
        conversation_id: ConversationId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), after_seq, limit],
            row_to_record,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, sender, encrypted_content, \
     content_type, enc_algorithm, enc_iv, enc_key_ref, reply_to, \
     is_edited, is_deleted, created_at, updated_at";

/// Cursor = hex-encoded big-endian sequence. Opaque to callers.
fn encode_cursor(seq: i64) -> String {
    hex::encode(seq.to_be_bytes())
}

fn decode_cursor(cursor: &str) -> Result<i64> {
    let bytes = hex::decode(cursor).map_err(|_| StoreError::InvalidCursor)?;
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::InvalidCursor)?;
    Ok(i64::from_be_bytes(arr))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sequence: i64 = row.get(2)?;
    let sender_hex: String = row.get(3)?;
    let encrypted_content: Vec<u8> = row.get(4)?;
    let content_type_str: String = row.get(5)?;
    let enc_algorithm: String = row.get(6)?;
    let enc_iv: Vec<u8> = row.get(7)?;
    let enc_key_ref: String = row.get(8)?;
    let reply_to_str: Option<String> = row.get(9)?;
    let is_edited: bool = row.get(10)?;
    let is_deleted: bool = row.get(11)?;
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let conversation_id = Uuid::parse_str(&conversation_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender = UserId::from_hex(&sender_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let content_type = ContentType::parse(&content_type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown content type: {content_type_str}").into(),
        )
    })?;
    let reply_to = match reply_to_str {
        Some(s) => Some(MessageId(Uuid::parse_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?)),
        None => None,
    };

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(MessageRecord {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sequence,
        sender,
        encrypted_content,
        content_type,
        encryption: EncryptionMetadata {
            algorithm: enc_algorithm,
            iv: enc_iv,
            key_ref: enc_key_ref,
        },
        reply_to,
        is_edited,
        is_deleted,
        created_at,
        updated_at,
    })
}
