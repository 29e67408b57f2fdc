//! Session registry.
//!
//! Maps user identity to the one live connection allowed per username.
//! Establishing a session for a username that is already online runs the
//! notify-old / close-old / install-new sequence under a per-username mutex,
//! so two concurrent logins for the same name cannot both win.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use palaver_shared::{ChatMessage, ControlSignal, Envelope, Target, UserId, UserProfile};

use crate::connection::ConnectionHandle;

/// The binding of an identity to one live connection.
#[derive(Debug)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub conn: ConnectionHandle,
    pub created_at: DateTime<Utc>,
    last_active: RwLock<DateTime<Utc>>,
}

impl Session {
    fn new(profile: UserProfile, conn: ConnectionHandle) -> Self {
        Self {
            user_id: profile.id,
            username: profile.username,
            conn,
            created_at: Utc::now(),
            last_active: RwLock::new(profile.last_active_at),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.user_id,
            username: self.username.clone(),
            last_active_at: *self.last_active.read().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// All live sessions, keyed by user id.
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<Session>>,
    /// One lock per username, serializing the login eviction sequence.
    login_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            login_locks: DashMap::new(),
        }
    }

    fn login_lock(&self, username: &str) -> Arc<Mutex<()>> {
        self.login_locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Install a new session, evicting any prior session for the same
    /// username first. The prior connection receives a terminal `Evicted`
    /// control message and is closed before the new session becomes visible.
    pub async fn establish(&self, profile: UserProfile, conn: ConnectionHandle) -> Arc<Session> {
        let username = profile.username.clone();
        let lock = self.login_lock(&username);
        let guard = lock.lock().await;

        let user_id = profile.id;
        if let Some(old) = self.sessions.get(&user_id).map(|e| Arc::clone(e.value())) {
            tracing::info!(
                user = %profile.username,
                old_conn = %old.conn.id,
                "evicting prior session for new login"
            );
            let notice = ChatMessage::control(
                Target::User(user_id),
                ControlSignal::Evicted {
                    reason: "logged in elsewhere".to_string(),
                },
            );
            old.conn.enqueue(Envelope::Message(notice));
            old.conn.close();
            self.sessions.remove(&user_id);
        }

        let session = Arc::new(Session::new(profile, conn));
        self.sessions.insert(user_id, Arc::clone(&session));

        drop(guard);
        // Two strong refs mean only the map and this call still hold the
        // lock; a login that is actually racing holds a third, which keeps
        // the entry alive. Removed entries are recreated on the next login,
        // so the map does not grow with every username ever seen.
        self.login_locks
            .remove_if(&username, |_, l| Arc::strong_count(l) == 2);
        session
    }

    /// Remove a session. Idempotent: ending a non-existent session is a
    /// no-op. The connection itself is not closed here; callers decide
    /// (logout flushes a response first, disconnect is already dead).
    pub fn end(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.sessions.remove(user_id).map(|(_, session)| session)
    }

    pub fn get(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of currently online profiles. Eventually consistent with
    /// concurrent joins and leaves.
    pub fn list_online(&self) -> Vec<UserProfile> {
        self.sessions.iter().map(|e| e.value().profile()).collect()
    }

    /// Every live session; used for global broadcasts.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Refresh a user's last-active timestamp (heartbeat).
    pub fn touch(&self, user_id: &UserId) {
        if let Some(session) = self.sessions.get(user_id) {
            *session
                .last_active
                .write()
                .unwrap_or_else(|e| e.into_inner()) = Utc::now();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
