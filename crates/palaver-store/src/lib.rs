//! # palaver-store
//!
//! SQLite persistence for the Palaver chat server.
//!
//! The crate exposes a [`Database`] handle that wraps a `rusqlite::Connection`
//! behind a mutex so it can be shared between connection tasks, and provides
//! typed helpers for the three persisted domains: user credentials, group
//! rosters, and message history.

pub mod credentials;
pub mod database;
pub mod groups;
pub mod history;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
