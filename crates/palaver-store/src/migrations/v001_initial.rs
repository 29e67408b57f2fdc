//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `groups`, `group_members`, and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (credential records, not sessions)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    username   TEXT PRIMARY KEY NOT NULL,
    id_hex     TEXT NOT NULL,               -- hex-encoded 32-byte blake3 of username
    proof_hash TEXT NOT NULL,               -- hex-encoded credential proof hash
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id         TEXT PRIMARY KEY NOT NULL,   -- "public" or UUID v4
    name       TEXT NOT NULL,
    creator    TEXT NOT NULL,               -- hex-encoded user id
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    user_id  TEXT NOT NULL,                 -- hex-encoded user id

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_key TEXT NOT NULL,              -- dm:<a>:<b> or grp:<id>
    body             BLOB NOT NULL,              -- bincode-encoded ChatMessage
    timestamp        TEXT NOT NULL               -- ISO-8601
);

CREATE INDEX IF NOT EXISTS idx_messages_key_ts
    ON messages(conversation_key, timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
