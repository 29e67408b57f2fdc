//! Narrow interfaces to the persistence backends.
//!
//! The dispatcher and router depend on these traits rather than on
//! `palaver_store::Database` directly, so tests can substitute in-memory or
//! failing backends. The SQLite database implements both.

use palaver_shared::{ChatMessage, ConversationKey};
use palaver_store::{Database, Result};

/// Credential provider consumed by the login path.
pub trait CredentialStore: Send + Sync {
    fn exists(&self, username: &str) -> Result<bool>;
    fn verify(&self, username: &str, password: &str) -> Result<bool>;
    fn register(&self, username: &str, password: &str) -> Result<()>;
}

/// Append/query message log per conversation key.
pub trait HistoryStore: Send + Sync {
    fn append(&self, key: &ConversationKey, message: &ChatMessage) -> Result<()>;

    /// Most-recent-`limit` selection, returned oldest first.
    fn recent(&self, key: &ConversationKey, limit: u32) -> Result<Vec<ChatMessage>>;
}

impl CredentialStore for Database {
    fn exists(&self, username: &str) -> Result<bool> {
        self.user_exists(username)
    }

    fn verify(&self, username: &str, password: &str) -> Result<bool> {
        self.verify_user(username, password)
    }

    fn register(&self, username: &str, password: &str) -> Result<()> {
        self.register_user(username, password)
    }
}

impl HistoryStore for Database {
    fn append(&self, key: &ConversationKey, message: &ChatMessage) -> Result<()> {
        self.append_message(key, message)
    }

    fn recent(&self, key: &ConversationKey, limit: u32) -> Result<Vec<ChatMessage>> {
        self.recent_messages(key, limit)
    }
}

/// History backend that fails every call. Used in tests to verify that a
/// broken store degrades history queries without touching live messaging.
#[cfg(test)]
pub struct BrokenHistory;

#[cfg(test)]
impl HistoryStore for BrokenHistory {
    fn append(&self, _key: &ConversationKey, _message: &ChatMessage) -> Result<()> {
        Err(palaver_store::StoreError::Migration("backend down".into()))
    }

    fn recent(&self, _key: &ConversationKey, _limit: u32) -> Result<Vec<ChatMessage>> {
        Err(palaver_store::StoreError::Migration("backend down".into()))
    }
}
