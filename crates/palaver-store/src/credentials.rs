//! Credential records.
//!
//! Passwords are never stored: only a domain-separated blake3 hash of
//! `username || password` is kept, enough to verify a login proof.

use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

/// Domain-separated credential proof hash.
fn proof_hash(username: &str, password: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"palaver-credential:v1");
    hasher.update(username.as_bytes());
    hasher.update(b"\x00");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

impl Database {
    /// Whether a credential record exists for this username.
    pub fn user_exists(&self, username: &str) -> Result<bool> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert a credential record. Fails if the username is taken.
    pub fn register_user(&self, username: &str, password: &str) -> Result<()> {
        let id_hex = hex::encode(blake3::hash(username.as_bytes()).as_bytes());
        self.conn().execute(
            "INSERT INTO users (username, id_hex, proof_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                username,
                id_hex,
                proof_hash(username, password),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Verify a login proof. Unknown usernames verify as false.
    pub fn verify_user(&self, username: &str, password: &str) -> Result<bool> {
        let stored: Option<String> = self
            .conn()
            .query_row(
                "SELECT proof_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(stored.as_deref() == Some(proof_hash(username, password).as_str()))
    }
}
