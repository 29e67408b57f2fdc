//! Request dispatcher.
//!
//! One `handle` call per inbound request; every request gets exactly one
//! response, correlated by request id. Errors are converted to failed
//! responses here, so a malformed or forbidden request never terminates the
//! connection that sent it.

use std::sync::Arc;

use uuid::Uuid;

use palaver_shared::{
    ChatMessage, ControlSignal, ConversationKey, Envelope, GroupId, MessageKind, Request,
    RequestBody, Response, ResponseKind, ResponsePayload, Target, UserId, UserProfile,
};

use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::directory::GroupDirectory;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::router::{MessageRouter, RouteOutcome};
use crate::stores::{CredentialStore, HistoryStore};

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    directory: Arc<GroupDirectory>,
    router: Arc<MessageRouter>,
    credentials: Arc<dyn CredentialStore>,
    history: Arc<dyn HistoryStore>,
    registration_open: bool,
    history_limit: u32,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: Arc<GroupDirectory>,
        router: Arc<MessageRouter>,
        credentials: Arc<dyn CredentialStore>,
        history: Arc<dyn HistoryStore>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            router,
            credentials,
            history,
            registration_open: config.registration_open,
            history_limit: config.history_limit,
        }
    }

    /// Serve one request on behalf of `conn`. `profile` is the connection's
    /// authenticated identity, set by a successful login and cleared by
    /// logout.
    pub async fn handle(
        &self,
        conn: &ConnectionHandle,
        profile: &mut Option<UserProfile>,
        request: Request,
    ) -> Response {
        let kind = response_kind(&request.body);
        let request_id = request.id;
        match self.dispatch(conn, profile, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(request = %request_id, error = %e, "request failed");
                e.into_response(Some(request_id), kind)
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &ConnectionHandle,
        profile: &mut Option<UserProfile>,
        request: Request,
    ) -> Result<Response, ServerError> {
        let id = request.id;
        match request.body {
            RequestBody::Login { username, password } => {
                self.login(conn, profile, id, &username, &password).await
            }
            RequestBody::Logout => {
                let p = profile.take().ok_or(ServerError::NotLoggedIn)?;
                self.registry.end(&p.id);
                tracing::info!(user = %p.username, "logged out");
                self.router.broadcast_control(ControlSignal::StatusChanged {
                    detail: format!("{} is offline", p.username),
                });
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::LogoutResult,
                    "logged out",
                    None,
                ))
            }
            RequestBody::SendMessage(message) => {
                let p = require_login(profile)?;
                self.send_message(id, p, message)
            }
            RequestBody::CreateGroup { name } => {
                let p = require_login(profile)?;
                let group = self.directory.create(&name, p.id);
                tracing::info!(group = %group.id, creator = %p.username, "group created");
                self.router.broadcast_control(ControlSignal::RefreshGroups);
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::GroupResult,
                    "group created",
                    Some(ResponsePayload::Group(group)),
                ))
            }
            RequestBody::JoinGroup { group_id } => {
                let p = require_login(profile)?;
                let changed = self.directory.join(&group_id, p.id)?;
                if changed {
                    self.router
                        .system_to_group(&group_id, &format!("{} joined the group", p.username));
                    self.router.broadcast_control(ControlSignal::RefreshGroups);
                }
                let group = self
                    .directory
                    .get(&group_id)
                    .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::GroupResult,
                    "joined group",
                    Some(ResponsePayload::Group(group)),
                ))
            }
            RequestBody::LeaveGroup { group_id } => {
                let p = require_login(profile)?;
                self.directory.leave(&group_id, &p.id)?;
                self.router
                    .system_to_group(&group_id, &format!("{} left the group", p.username));
                self.router.broadcast_control(ControlSignal::RefreshGroups);
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::GroupResult,
                    "left group",
                    None,
                ))
            }
            RequestBody::DissolveGroup { group_id } => {
                let p = require_login(profile)?;
                let removed = self.directory.dissolve(&group_id, &p.id)?;
                tracing::info!(group = %group_id, by = %p.username, "group dissolved");
                for member in &removed.members {
                    if member == &p.id {
                        continue;
                    }
                    if let Some(session) = self.registry.get(member) {
                        let notice = ChatMessage::system(
                            Target::User(*member),
                            format!("group '{}' was dissolved", removed.name),
                        );
                        session.conn.enqueue(Envelope::Message(notice));
                    }
                }
                self.router.broadcast_control(ControlSignal::RefreshGroups);
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::GroupResult,
                    "group dissolved",
                    None,
                ))
            }
            RequestBody::InviteToGroup { group_id, invitee } => {
                let p = require_login(profile)?;
                self.invite(id, p, &group_id, invitee)
            }
            RequestBody::GetUsers => {
                require_login(profile)?;
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::UserList,
                    "online users",
                    Some(ResponsePayload::Users(self.registry.list_online())),
                ))
            }
            RequestBody::GetGroups => {
                let p = require_login(profile)?;
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::GroupList,
                    "your groups",
                    Some(ResponsePayload::Groups(self.directory.groups_for(&p.id))),
                ))
            }
            RequestBody::GetHistory { target, limit } => {
                let p = require_login(profile)?;
                let key = match &target {
                    Target::Group(group_id) => {
                        if self.directory.get(group_id).is_none() {
                            return Err(ServerError::NotFound(format!("group {group_id}")));
                        }
                        ConversationKey::group(group_id)
                    }
                    Target::User(other) => ConversationKey::direct(&p.id, other),
                };
                let limit = limit.unwrap_or(self.history_limit).min(self.history_limit);
                let messages = self.history.recent(&key, limit)?;
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::HistoryMessages,
                    format!("{} messages", messages.len()),
                    Some(ResponsePayload::History(messages)),
                ))
            }
            RequestBody::Heartbeat => {
                let p = require_login(profile)?;
                self.registry.touch(&p.id);
                Ok(Response::ok(
                    Some(id),
                    ResponseKind::GenericResult,
                    "alive",
                    None,
                ))
            }
            RequestBody::TransferFile => Err(ServerError::Unsupported("file transfer")),
            RequestBody::VoiceCall => Err(ServerError::Unsupported("voice call")),
        }
    }

    /// Authenticate (registering implicitly when allowed), evict any prior
    /// session for the username, join the public room, and hand back the
    /// login snapshot.
    async fn login(
        &self,
        conn: &ConnectionHandle,
        profile: &mut Option<UserProfile>,
        request_id: Uuid,
        username: &str,
        password: &str,
    ) -> Result<Response, ServerError> {
        if !self.credentials.exists(username)? {
            if !self.registration_open {
                tracing::info!(user = %username, "unknown username rejected");
                return Err(ServerError::InvalidCredentials);
            }
            self.credentials.register(username, password)?;
            tracing::info!(user = %username, "registered at first login");
        } else if !self.credentials.verify(username, password)? {
            tracing::info!(user = %username, "bad password");
            return Err(ServerError::InvalidCredentials);
        }

        // A connection re-authenticating under a new identity ends its
        // current session first; the old identity must not linger in the
        // registry bound to a handle that now belongs to someone else. A
        // failed login above leaves the existing session untouched.
        if let Some(prev) = profile.take() {
            let owns_session = self
                .registry
                .get(&prev.id)
                .is_some_and(|s| s.conn.id == conn.id);
            if owns_session {
                self.registry.end(&prev.id);
                tracing::info!(user = %prev.username, "session ended by re-login");
                self.router.broadcast_control(ControlSignal::StatusChanged {
                    detail: format!("{} is offline", prev.username),
                });
            }
        }

        let new_profile = UserProfile::new(username);
        self.registry
            .establish(new_profile.clone(), conn.clone())
            .await;
        // Everyone is a member of the public room from their first login on.
        self.directory.join(&GroupId::public(), new_profile.id)?;

        let public_group = self.directory.public_room();
        let member_groups = self.directory.groups_for(&new_profile.id);

        tracing::info!(
            user = %username,
            conn = %conn.id,
            online = self.registry.len(),
            "logged in"
        );
        self.router.broadcast_control(ControlSignal::StatusChanged {
            detail: format!("{username} is online"),
        });

        *profile = Some(new_profile.clone());
        Ok(Response::ok(
            Some(request_id),
            ResponseKind::LoginResult,
            "login successful",
            Some(ResponsePayload::LoginOk {
                profile: new_profile,
                public_group,
                member_groups,
            }),
        ))
    }

    fn send_message(
        &self,
        request_id: Uuid,
        sender: &UserProfile,
        message: ChatMessage,
    ) -> Result<Response, ServerError> {
        // System and Control kinds are reserved for the server.
        if matches!(message.kind, MessageKind::System | MessageKind::Control) {
            return Err(ServerError::Forbidden(
                "clients may not send server message kinds".into(),
            ));
        }
        if message.sender != Some(sender.id) {
            return Err(ServerError::SenderMismatch);
        }
        if let Target::Group(group_id) = &message.target {
            if !self.directory.is_member(group_id, &sender.id) {
                if self.directory.get(group_id).is_none() {
                    return Err(ServerError::NotFound(format!("group {group_id}")));
                }
                return Err(ServerError::Forbidden(
                    "not a member of the target group".into(),
                ));
            }
        }

        match self.router.route(&message)? {
            RouteOutcome::Delivered { recipients } => Ok(Response::ok(
                Some(request_id),
                ResponseKind::MessageResult,
                format!("delivered to {recipients} recipients"),
                None,
            )),
            RouteOutcome::RecipientOffline => Err(ServerError::RecipientOffline),
        }
    }

    fn invite(
        &self,
        request_id: Uuid,
        inviter: &UserProfile,
        group_id: &GroupId,
        invitee: UserId,
    ) -> Result<Response, ServerError> {
        let group = self
            .directory
            .get(group_id)
            .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;
        if !group.is_member(&inviter.id) {
            return Err(ServerError::Forbidden("only members may invite".into()));
        }
        if group.is_member(&invitee) {
            return Ok(Response::ok(
                Some(request_id),
                ResponseKind::GroupResult,
                "already a member",
                None,
            ));
        }

        let session = self
            .registry
            .get(&invitee)
            .ok_or(ServerError::RecipientOffline)?;
        let invite = ChatMessage::control(
            Target::User(invitee),
            ControlSignal::GroupInvite {
                group_id: group.id.clone(),
                group_name: group.name.clone(),
                inviter: inviter.id,
            },
        );
        session.conn.enqueue(Envelope::Message(invite));
        Ok(Response::ok(
            Some(request_id),
            ResponseKind::GroupResult,
            "invitation sent",
            None,
        ))
    }

    /// Clean up after a connection that went away without a logout. Ends the
    /// session only if this connection still owns it; after an eviction the
    /// identity belongs to a newer connection and must be left alone.
    pub fn disconnect(&self, conn: &ConnectionHandle, profile: &Option<UserProfile>) {
        let Some(p) = profile else {
            return;
        };
        let Some(session) = self.registry.get(&p.id) else {
            return;
        };
        if session.conn.id != conn.id {
            return;
        }
        self.registry.end(&p.id);
        let session_secs = (chrono::Utc::now() - session.created_at).num_seconds();
        tracing::info!(user = %p.username, session_secs, "session ended on disconnect");
        self.router.broadcast_control(ControlSignal::StatusChanged {
            detail: format!("{} is offline", p.username),
        });
    }
}

fn require_login(profile: &Option<UserProfile>) -> Result<&UserProfile, ServerError> {
    profile.as_ref().ok_or(ServerError::NotLoggedIn)
}

/// The response kind owed to each request, also used for failure responses.
fn response_kind(body: &RequestBody) -> ResponseKind {
    match body {
        RequestBody::Login { .. } => ResponseKind::LoginResult,
        RequestBody::Logout => ResponseKind::LogoutResult,
        RequestBody::SendMessage(_) => ResponseKind::MessageResult,
        RequestBody::CreateGroup { .. }
        | RequestBody::JoinGroup { .. }
        | RequestBody::LeaveGroup { .. }
        | RequestBody::DissolveGroup { .. }
        | RequestBody::InviteToGroup { .. } => ResponseKind::GroupResult,
        RequestBody::GetUsers => ResponseKind::UserList,
        RequestBody::GetGroups => ResponseKind::GroupList,
        RequestBody::GetHistory { .. } => ResponseKind::HistoryMessages,
        RequestBody::TransferFile => ResponseKind::FileResult,
        RequestBody::Heartbeat | RequestBody::VoiceCall => ResponseKind::GenericResult,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_store::Database;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<SessionRegistry>,
        directory: Arc<GroupDirectory>,
        db: Arc<Database>,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(ServerConfig::default())
    }

    fn fixture_with(config: ServerConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_at(&tmp.path().join("test.db")).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let directory = Arc::new(GroupDirectory::load(Arc::clone(&db)).unwrap());
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&db) as Arc<dyn HistoryStore>,
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            router,
            Arc::clone(&db) as Arc<dyn CredentialStore>,
            Arc::clone(&db) as Arc<dyn HistoryStore>,
            &config,
        );
        Fixture {
            dispatcher,
            registry,
            directory,
            db,
            _tmp: tmp,
        }
    }

    struct Client {
        conn: ConnectionHandle,
        rx: mpsc::Receiver<Envelope>,
        profile: Option<UserProfile>,
    }

    impl Client {
        fn id(&self) -> UserId {
            self.profile.as_ref().unwrap().id
        }

        fn messages(&mut self) -> Vec<ChatMessage> {
            let mut out = Vec::new();
            while let Ok(env) = self.rx.try_recv() {
                if let Envelope::Message(m) = env {
                    out.push(m);
                }
            }
            out
        }
    }

    async fn request(fx: &Fixture, client: &mut Client, body: RequestBody) -> Response {
        fx.dispatcher
            .handle(&client.conn, &mut client.profile, Request::new(body))
            .await
    }

    async fn login(fx: &Fixture, name: &str) -> Client {
        let (conn, backend) = ConnectionHandle::new(32);
        let mut client = Client {
            conn,
            rx: backend.outbound_rx,
            profile: None,
        };
        let resp = request(
            fx,
            &mut client,
            RequestBody::Login {
                username: name.into(),
                password: "hunter2".into(),
            },
        )
        .await;
        assert!(resp.success, "login failed: {}", resp.message);
        client
    }

    #[tokio::test]
    async fn login_registers_and_joins_public_room() {
        let fx = fixture();
        let alice = login(&fx, "alice").await;

        assert_eq!(fx.registry.len(), 1);
        assert!(fx
            .directory
            .is_member(&GroupId::public(), &alice.id()));
        assert!(fx.db.user_exists("alice").unwrap());
    }

    #[tokio::test]
    async fn login_snapshot_includes_public_room() {
        let fx = fixture();
        let (conn, _backend) = ConnectionHandle::new(32);
        let mut profile = None;
        let resp = fx
            .dispatcher
            .handle(
                &conn,
                &mut profile,
                Request::new(RequestBody::Login {
                    username: "alice".into(),
                    password: "pw".into(),
                }),
            )
            .await;

        assert_eq!(resp.kind, ResponseKind::LoginResult);
        match resp.payload {
            Some(ResponsePayload::LoginOk {
                profile: p,
                public_group,
                member_groups,
            }) => {
                assert_eq!(p.username, "alice");
                assert!(public_group.id.is_public());
                assert!(member_groups.iter().any(|g| g.id.is_public()));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let fx = fixture();
        let _alice = login(&fx, "alice").await;

        let (conn, _backend) = ConnectionHandle::new(32);
        let mut profile = None;
        let resp = fx
            .dispatcher
            .handle(
                &conn,
                &mut profile,
                Request::new(RequestBody::Login {
                    username: "alice".into(),
                    password: "not-hunter2".into(),
                }),
            )
            .await;

        assert!(!resp.success);
        assert!(profile.is_none());
        // The established session is untouched.
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn closed_registration_rejects_unknown_users() {
        let fx = fixture_with(ServerConfig {
            registration_open: false,
            ..ServerConfig::default()
        });
        let (conn, _backend) = ConnectionHandle::new(32);
        let mut profile = None;
        let resp = fx
            .dispatcher
            .handle(
                &conn,
                &mut profile,
                Request::new(RequestBody::Login {
                    username: "nobody".into(),
                    password: "pw".into(),
                }),
            )
            .await;

        assert!(!resp.success);
        assert!(!fx.db.user_exists("nobody").unwrap());
    }

    #[tokio::test]
    async fn second_login_evicts_first_connection() {
        let fx = fixture();
        let mut first = login(&fx, "alice").await;
        let second = login(&fx, "alice").await;

        assert!(first.conn.is_closed());
        assert!(!second.conn.is_closed());
        assert!(first
            .messages()
            .iter()
            .any(|m| matches!(m.control, Some(ControlSignal::Evicted { .. }))));
    }

    #[tokio::test]
    async fn requests_before_login_are_rejected() {
        let fx = fixture();
        let (conn, backend) = ConnectionHandle::new(32);
        let mut client = Client {
            conn,
            rx: backend.outbound_rx,
            profile: None,
        };

        let resp = request(&fx, &mut client, RequestBody::GetUsers).await;
        assert!(!resp.success);
        assert_eq!(resp.kind, ResponseKind::UserList);
        assert_eq!(resp.message, "not logged in");
    }

    #[tokio::test]
    async fn public_room_message_reaches_other_member() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let mut bob = login(&fx, "bob").await;
        alice.messages();
        bob.messages();

        let msg = ChatMessage::text(alice.id(), Target::Group(GroupId::public()), "hi all");
        let resp = request(&fx, &mut alice, RequestBody::SendMessage(msg)).await;
        assert!(resp.success);

        let received = bob.messages();
        assert!(received.iter().any(|m| m.content == "hi all"));

        let key = ConversationKey::group(&GroupId::public());
        assert_eq!(fx.db.message_count(&key).unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_message_to_offline_user_fails_but_is_archived() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let carol = UserId::from_username("carol");

        let msg = ChatMessage::text(alice.id(), Target::User(carol), "see you");
        let resp = request(&fx, &mut alice, RequestBody::SendMessage(msg)).await;

        assert!(!resp.success);
        assert_eq!(resp.message, "recipient is offline");

        let key = ConversationKey::direct(&alice.id(), &carol);
        assert_eq!(fx.db.message_count(&key).unwrap(), 1);
    }

    #[tokio::test]
    async fn spoofed_sender_is_rejected() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let bob = login(&fx, "bob").await;

        let msg = ChatMessage::text(bob.id(), Target::Group(GroupId::public()), "from bob");
        let resp = request(&fx, &mut alice, RequestBody::SendMessage(msg)).await;

        assert!(!resp.success);
        let key = ConversationKey::group(&GroupId::public());
        assert_eq!(fx.db.message_count(&key).unwrap(), 0);
    }

    #[tokio::test]
    async fn non_members_cannot_post_to_a_group() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let mut bob = login(&fx, "bob").await;

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::CreateGroup { name: "solo".into() },
        )
        .await;
        let group_id = match resp.payload {
            Some(ResponsePayload::Group(g)) => g.id,
            other => panic!("unexpected payload: {other:?}"),
        };

        let msg = ChatMessage::text(bob.id(), Target::Group(group_id), "let me in");
        let resp = request(&fx, &mut bob, RequestBody::SendMessage(msg)).await;
        assert!(!resp.success);
        assert!(resp.message.contains("forbidden"));
    }

    #[tokio::test]
    async fn history_round_trip_through_requests() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;

        for i in 0..3 {
            let msg = ChatMessage::text(
                alice.id(),
                Target::Group(GroupId::public()),
                format!("msg {i}"),
            );
            request(&fx, &mut alice, RequestBody::SendMessage(msg)).await;
        }

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::GetHistory {
                target: Target::Group(GroupId::public()),
                limit: Some(2),
            },
        )
        .await;

        match resp.payload {
            Some(ResponsePayload::History(messages)) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].content, "msg 1");
                assert_eq!(messages[1].content, "msg 2");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn creator_cannot_leave_own_group() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::CreateGroup { name: "mine".into() },
        )
        .await;
        let group_id = match resp.payload {
            Some(ResponsePayload::Group(g)) => g.id,
            other => panic!("unexpected payload: {other:?}"),
        };

        let resp = request(&fx, &mut alice, RequestBody::LeaveGroup { group_id }).await;
        assert!(!resp.success);
        assert!(resp.message.contains("dissolve"));
    }

    #[tokio::test]
    async fn dissolve_notifies_online_members() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let mut bob = login(&fx, "bob").await;

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::CreateGroup { name: "temp".into() },
        )
        .await;
        let group_id = match resp.payload {
            Some(ResponsePayload::Group(g)) => g.id,
            other => panic!("unexpected payload: {other:?}"),
        };
        request(
            &fx,
            &mut bob,
            RequestBody::JoinGroup {
                group_id: group_id.clone(),
            },
        )
        .await;
        bob.messages();

        let resp = request(&fx, &mut alice, RequestBody::DissolveGroup { group_id: group_id.clone() }).await;
        assert!(resp.success);
        assert!(fx.directory.get(&group_id).is_none());

        let received = bob.messages();
        assert!(received.iter().any(|m| m.content.contains("dissolved")));
    }

    #[tokio::test]
    async fn invite_reaches_online_invitee() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let mut bob = login(&fx, "bob").await;

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::CreateGroup { name: "club".into() },
        )
        .await;
        let group_id = match resp.payload {
            Some(ResponsePayload::Group(g)) => g.id,
            other => panic!("unexpected payload: {other:?}"),
        };
        bob.messages();

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::InviteToGroup {
                group_id: group_id.clone(),
                invitee: bob.id(),
            },
        )
        .await;
        assert!(resp.success);
        assert_eq!(resp.kind, ResponseKind::GroupResult);

        let received = bob.messages();
        assert!(received.iter().any(|m| matches!(
            &m.control,
            Some(ControlSignal::GroupInvite { group_id: g, .. }) if g == &group_id
        )));
    }

    #[tokio::test]
    async fn logout_ends_session_without_closing_connection() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;

        let resp = request(&fx, &mut alice, RequestBody::Logout).await;
        assert!(resp.success);
        assert!(alice.profile.is_none());
        assert!(fx.registry.is_empty());
        // The socket layer decides when to close, after flushing the response.
        assert!(!alice.conn.is_closed());
    }

    #[tokio::test]
    async fn relogin_as_other_user_ends_prior_session() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;
        let alice_id = alice.id();

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::Login {
                username: "bob".into(),
                password: "hunter2".into(),
            },
        )
        .await;
        assert!(resp.success);

        // The connection now belongs to bob; alice's session is gone.
        assert!(fx.registry.get(&alice_id).is_none());
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(alice.profile.as_ref().unwrap().username, "bob");

        // Disconnect leaves no ghost behind either identity.
        fx.dispatcher.disconnect(&alice.conn, &alice.profile);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn failed_relogin_keeps_current_session() {
        let fx = fixture();
        let bob = login(&fx, "bob").await;
        drop(bob);
        let mut alice = login(&fx, "alice").await;
        let alice_id = alice.id();

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::Login {
                username: "bob".into(),
                password: "wrong".into(),
            },
        )
        .await;
        assert!(!resp.success);

        assert!(fx.registry.get(&alice_id).is_some());
        assert_eq!(alice.profile.as_ref().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn disconnect_after_eviction_leaves_new_session_alone() {
        let fx = fixture();
        let first = login(&fx, "alice").await;
        let second = login(&fx, "alice").await;

        // The stale connection's cleanup must not tear down the new session.
        fx.dispatcher.disconnect(&first.conn, &first.profile);
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(
            fx.registry.get(&second.id()).unwrap().conn.id,
            second.conn.id
        );

        fx.dispatcher.disconnect(&second.conn, &second.profile);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn declared_but_unserved_requests_are_rejected() {
        let fx = fixture();
        let mut alice = login(&fx, "alice").await;

        let resp = request(&fx, &mut alice, RequestBody::TransferFile).await;
        assert!(!resp.success);
        assert_eq!(resp.kind, ResponseKind::FileResult);
        assert!(resp.message.contains("unsupported"));

        let resp = request(&fx, &mut alice, RequestBody::VoiceCall).await;
        assert!(!resp.success);
        assert!(resp.message.contains("unsupported"));
    }

    #[tokio::test]
    async fn broken_history_fails_queries_but_not_messaging() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_at(&tmp.path().join("test.db")).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let directory = Arc::new(GroupDirectory::load(Arc::clone(&db)).unwrap());
        let broken = Arc::new(crate::stores::BrokenHistory);
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&broken) as Arc<dyn HistoryStore>,
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            router,
            Arc::clone(&db) as Arc<dyn CredentialStore>,
            broken,
            &ServerConfig::default(),
        );
        let fx = Fixture {
            dispatcher,
            registry,
            directory,
            db,
            _tmp: tmp,
        };

        let mut alice = login(&fx, "alice").await;
        let mut bob = login(&fx, "bob").await;
        bob.messages();

        let msg = ChatMessage::text(alice.id(), Target::Group(GroupId::public()), "still on");
        let resp = request(&fx, &mut alice, RequestBody::SendMessage(msg)).await;
        assert!(resp.success);
        assert!(bob.messages().iter().any(|m| m.content == "still on"));

        let resp = request(
            &fx,
            &mut alice,
            RequestBody::GetHistory {
                target: Target::Group(GroupId::public()),
                limit: None,
            },
        )
        .await;
        assert!(!resp.success);
        assert!(resp.message.contains("store unavailable"));
    }
}
