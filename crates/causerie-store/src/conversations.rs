//! CRUD operations for [`Conversation`] and [`Participant`] records.
//!
//! The administrative surface (create conversation, add/remove member) is
//! external to the message pipeline; the pipeline only consumes the state
//! these helpers maintain.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use causerie_shared::types::{ConversationId, ConversationKind, ParticipantRole, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Participant};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create (or return the existing) direct conversation between two
    /// users. Direct conversations are deduplicated by the unordered
    /// participant pair: calling this twice, in either argument order,
    /// yields the same conversation.
    pub fn create_direct_conversation(&self, a: UserId, b: UserId) -> Result<Conversation> {
        if a == b {
            return Err(StoreError::Invariant(
                "direct conversation requires two distinct users".into(),
            ));
        }

        if let Some(existing) = self.find_direct_conversation(a, b)? {
            return Ok(existing);
        }

        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Direct,
            name: None,
            created_at: Utc::now(),
        };

        // Conversation and membership rows commit together; a failure on
        // either participant rolls the whole creation back.
        let tx = self.conn().unchecked_transaction()?;
        insert_conversation(&tx, &conversation)?;
        insert_participant(&tx, conversation.id, a, ParticipantRole::Member)?;
        insert_participant(&tx, conversation.id, b, ParticipantRole::Member)?;
        tx.commit()?;

        Ok(conversation)
    }

    /// Create a group conversation. The creator becomes admin; the final
    /// participant set (creator + members) must hold at least two users.
    pub fn create_group_conversation(
        &self,
        name: &str,
        creator: UserId,
        members: &[UserId],
    ) -> Result<Conversation> {
        let mut set: Vec<UserId> = vec![creator];
        for m in members {
            if !set.contains(m) {
                set.push(*m);
            }
        }
        if set.len() < 2 {
            return Err(StoreError::Invariant(
                "group conversation requires at least two participants".into(),
            ));
        }

        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group,
            name: Some(name.to_string()),
            created_at: Utc::now(),
        };

        let tx = self.conn().unchecked_transaction()?;
        insert_conversation(&tx, &conversation)?;
        for user in &set {
            let role = if *user == creator {
                ParticipantRole::Admin
            } else {
                ParticipantRole::Member
            };
            insert_participant(&tx, conversation.id, *user, role)?;
        }
        tx.commit()?;

        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, kind, name, created_at
                 FROM conversations
                 WHERE id = ?1",
                params![id.0.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The existing direct conversation between exactly these two users.
    fn find_direct_conversation(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        self.conn()
            .query_row(
                "SELECT c.id, c.kind, c.name, c.created_at
                 FROM conversations c
                 WHERE c.kind = 'direct'
                   AND EXISTS (SELECT 1 FROM participants
                               WHERE conversation_id = c.id AND user_id = ?1)
                   AND EXISTS (SELECT 1 FROM participants
                               WHERE conversation_id = c.id AND user_id = ?2)",
                params![a.to_hex(), b.to_hex()],
                row_to_conversation,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// All participants of a conversation, admins first.
    pub fn participants(&self, conversation_id: ConversationId) -> Result<Vec<Participant>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id, user_id, role, joined_at, last_read_seq
             FROM participants
             WHERE conversation_id = ?1
             ORDER BY role ASC, joined_at ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.0.to_string()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// Whether the user is currently a participant.
    pub fn is_participant(&self, conversation_id: ConversationId, user_id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM participants
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.0.to_string(), user_id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ids of every conversation the user participates in. This drives the
    /// connection handler's bus subscriptions.
    pub fn conversations_for_user(&self, user_id: UserId) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM participants WHERE user_id = ?1",
        )?;

        let rows = stmt.query_map(params![user_id.to_hex()], |row| {
            let id: String = row.get(0)?;
            Ok(id)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            let id_str = row?;
            ids.push(ConversationId(Uuid::parse_str(&id_str)?));
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Update / delete
    // ------------------------------------------------------------------

    /// Add a participant to a group conversation. Direct conversations are
    /// fixed at their two members.
    pub fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<()> {
        let conversation = self.get_conversation(conversation_id)?;
        if conversation.kind == ConversationKind::Direct {
            return Err(StoreError::Invariant(
                "cannot add participants to a direct conversation".into(),
            ));
        }
        insert_participant(self.conn(), conversation_id, user_id, role)
    }

    /// Remove a participant. Unknown memberships are a no-op.
    pub fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        self.conn().execute(
            "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.0.to_string(), user_id.to_hex()],
        )?;
        Ok(())
    }

    /// Advance the user's last-read marker. Monotonic: a stale (lower)
    /// sequence never moves the marker backwards.
    pub fn set_last_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        seq: i64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE participants
             SET last_read_seq = ?3
             WHERE conversation_id = ?1 AND user_id = ?2
               AND (last_read_seq IS NULL OR last_read_seq < ?3)",
            params![conversation_id.0.to_string(), user_id.to_hex(), seq],
        )?;
        Ok(())
    }
}

fn insert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, kind, name, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            conversation.id.0.to_string(),
            conversation.kind.as_str(),
            conversation.name,
            conversation.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_participant(
    conn: &Connection,
    conversation_id: ConversationId,
    user_id: UserId,
    role: ParticipantRole,
) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (conversation_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            conversation_id.0.to_string(),
            user_id.to_hex(),
            role.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let name: Option<String> = row.get(2)?;
    let ts_str: String = row.get(3)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let kind = ConversationKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown conversation kind: {kind_str}").into(),
        )
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Conversation {
        id: ConversationId(id),
        kind,
        name,
        created_at,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let conversation_str: String = row.get(0)?;
    let user_hex: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let joined_str: String = row.get(3)?;
    let last_read_seq: Option<i64> = row.get(4)?;

    let conversation_id = Uuid::parse_str(&conversation_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let user_id = UserId::from_hex(&user_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let role = ParticipantRole::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role: {role_str}").into(),
        )
    })?;

    let joined_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&joined_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Participant {
        conversation_id: ConversationId(conversation_id),
        user_id,
        role,
        joined_at,
        last_read_seq,
    })
}
