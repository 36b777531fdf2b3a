//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `conversations`, `participants`,
//! `messages`, and `delivery_status`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    kind       TEXT NOT NULL,               -- 'direct' | 'group'
    name       TEXT,                        -- groups only
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL,          -- FK -> conversations(id)
    user_id         TEXT NOT NULL,          -- hex-encoded 32-byte pubkey
    role            TEXT NOT NULL,          -- 'admin' | 'member'
    joined_at       TEXT NOT NULL,
    last_read_seq   INTEGER,                -- highest seq read, nullable

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
-- seq is assigned atomically with the insert and is the authoritative
-- ordering within a conversation. Tombstoned rows keep their seq slot.
CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4, pipeline-assigned
    conversation_id   TEXT NOT NULL,              -- FK -> conversations(id)
    seq               INTEGER NOT NULL,           -- per-conversation, monotonic
    sender            TEXT NOT NULL,              -- hex-encoded pubkey
    encrypted_content BLOB NOT NULL,              -- opaque ciphertext
    content_type      TEXT NOT NULL,              -- 'text'|'file'|'image'|'system'
    enc_algorithm     TEXT NOT NULL,
    enc_iv            BLOB NOT NULL,
    enc_key_ref       TEXT NOT NULL,              -- key-exchange reference, never a key
    reply_to          TEXT,                       -- nullable FK -> messages(id)
    is_edited         INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    is_deleted        INTEGER NOT NULL DEFAULT 0, -- boolean 0/1 (tombstone)
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq DESC);

-- ----------------------------------------------------------------
-- Delivery status
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS delivery_status (
    message_id TEXT NOT NULL,                -- FK -> messages(id)
    user_id    TEXT NOT NULL,                -- hex-encoded pubkey
    status     TEXT NOT NULL,                -- 'sent'|'delivered'|'read'
    updated_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
