//! Message history, keyed by conversation.
//!
//! Each row stores the bincode-encoded [`ChatMessage`] plus the indexed
//! conversation key and timestamp used for retrieval.

use chrono::{DateTime, Utc};
use rusqlite::params;

use palaver_shared::{ChatMessage, ConversationKey};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Append a message to a conversation's history.
    pub fn append_message(&self, key: &ConversationKey, message: &ChatMessage) -> Result<()> {
        let body = bincode::serialize(message)?;
        self.conn().execute(
            "INSERT INTO messages (id, conversation_key, body, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message.id.to_string(),
                key.as_str(),
                body,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages of a conversation, returned in
    /// chronological order (oldest first).
    pub fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT body FROM messages
             WHERE conversation_key = ?1
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![key.as_str(), limit], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(bincode::deserialize(&row?)?);
        }
        // Newest-first selection, oldest-first presentation.
        messages.reverse();
        Ok(messages)
    }

    /// Number of stored messages for a conversation.
    pub fn message_count(&self, key: &ConversationKey) -> Result<u64> {
        let count: u64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete messages older than the cutoff. Returns the number removed.
    pub fn prune_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_shared::{GroupId, Target, UserId};

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn append_then_query_preserves_order() {
        let (_dir, db) = open_db();

        let alice = UserId::from_username("alice");
        let key = ConversationKey::group(&GroupId::public());
        let target = Target::Group(GroupId::public());

        let m1 = ChatMessage::text(alice, target.clone(), "first");
        let m2 = ChatMessage::text(alice, target, "second");

        db.append_message(&key, &m1).unwrap();
        db.append_message(&key, &m2).unwrap();

        let history = db.recent_messages(&key, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].content, "second");
    }

    #[test]
    fn limit_selects_most_recent() {
        let (_dir, db) = open_db();

        let alice = UserId::from_username("alice");
        let key = ConversationKey::group(&GroupId::public());

        for i in 0..5 {
            let msg = ChatMessage::text(
                alice,
                Target::Group(GroupId::public()),
                format!("msg {i}"),
            );
            db.append_message(&key, &msg).unwrap();
        }

        let history = db.recent_messages(&key, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "msg 3");
        assert_eq!(history[1].content, "msg 4");
    }

    #[test]
    fn prune_removes_only_messages_past_the_cutoff() {
        let (_dir, db) = open_db();

        let alice = UserId::from_username("alice");
        let key = ConversationKey::group(&GroupId::public());

        let mut old = ChatMessage::text(alice, Target::Group(GroupId::public()), "stale");
        old.timestamp = Utc::now() - chrono::Duration::days(10);
        let fresh = ChatMessage::text(alice, Target::Group(GroupId::public()), "fresh");

        db.append_message(&key, &old).unwrap();
        db.append_message(&key, &fresh).unwrap();

        let removed = db
            .prune_messages_before(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = db.recent_messages(&key, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "fresh");
    }

    #[test]
    fn conversations_are_isolated() {
        let (_dir, db) = open_db();

        let alice = UserId::from_username("alice");
        let bob = UserId::from_username("bob");

        let dm_key = ConversationKey::direct(&alice, &bob);
        let room_key = ConversationKey::group(&GroupId::public());

        let dm = ChatMessage::text(alice, Target::User(bob), "psst");
        db.append_message(&dm_key, &dm).unwrap();

        assert_eq!(db.message_count(&dm_key).unwrap(), 1);
        assert!(db.recent_messages(&room_key, 10).unwrap().is_empty());
    }
}
