//! Message router.
//!
//! Resolves a message's recipients and performs delivery. History writes
//! happen before delivery and are independent of it: a recipient being
//! offline or slow never rolls back or blocks the append, and an append
//! failure never blocks delivery.

use std::sync::Arc;

use palaver_shared::{
    ChatMessage, ControlSignal, ConversationKey, Envelope, GroupId, MessageKind, Target,
};

use crate::directory::GroupDirectory;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::stores::HistoryStore;

/// What happened to a routed message.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Enqueued to this many live sessions (offline group members skipped).
    Delivered { recipients: usize },
    /// Direct target has no live session. History was still appended.
    RecipientOffline,
}

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    directory: Arc<GroupDirectory>,
    history: Arc<dyn HistoryStore>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: Arc<GroupDirectory>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            registry,
            directory,
            history,
        }
    }

    /// Deliver a user-sent message to its target(s).
    ///
    /// Group targets fan out to every member with a live session; direct
    /// targets reach the single session or report [`RouteOutcome::RecipientOffline`].
    pub fn route(&self, message: &ChatMessage) -> Result<RouteOutcome, ServerError> {
        match &message.target {
            Target::Group(group_id) => {
                let members = self
                    .directory
                    .members_of(group_id)
                    .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;

                self.append_history(message);

                let mut recipients = 0;
                for member in members {
                    if let Some(session) = self.registry.get(&member) {
                        if session.conn.enqueue(Envelope::Message(message.clone())) {
                            recipients += 1;
                        }
                    }
                }
                tracing::debug!(
                    group = %group_id,
                    recipients,
                    "routed group message"
                );
                Ok(RouteOutcome::Delivered { recipients })
            }
            Target::User(user_id) => {
                self.append_history(message);

                match self.registry.get(user_id) {
                    Some(session) => {
                        session.conn.enqueue(Envelope::Message(message.clone()));
                        Ok(RouteOutcome::Delivered { recipients: 1 })
                    }
                    None => {
                        tracing::debug!(target = %user_id.short(), "recipient offline");
                        Ok(RouteOutcome::RecipientOffline)
                    }
                }
            }
        }
    }

    /// Append to the conversation log. Control messages are never persisted;
    /// failures are logged and swallowed (fire-and-forget relative to
    /// delivery).
    fn append_history(&self, message: &ChatMessage) {
        if message.kind == MessageKind::Control {
            return;
        }
        let Some(key) = conversation_key(message) else {
            return;
        };
        if let Err(e) = self.history.append(&key, message) {
            tracing::warn!(key = %key, error = %e, "history append failed");
        }
    }

    /// Sender-less System notification to every live session. Not persisted.
    pub fn broadcast_system(&self, content: &str) {
        let message = ChatMessage::system(Target::Group(GroupId::public()), content);
        self.broadcast(message);
    }

    /// Structured Control signal to every live session.
    pub fn broadcast_control(&self, signal: ControlSignal) {
        let message = ChatMessage::control(Target::Group(GroupId::public()), signal);
        self.broadcast(message);
    }

    fn broadcast(&self, message: ChatMessage) {
        for session in self.registry.all_sessions() {
            session.conn.enqueue(Envelope::Message(message.clone()));
        }
    }

    /// System notification to the live members of one group. Not persisted.
    pub fn system_to_group(&self, group_id: &GroupId, content: &str) {
        let Some(members) = self.directory.members_of(group_id) else {
            return;
        };
        let message = ChatMessage::system(Target::Group(group_id.clone()), content);
        for member in members {
            if let Some(session) = self.registry.get(&member) {
                session.conn.enqueue(Envelope::Message(message.clone()));
            }
        }
    }
}

/// History index for a message: the unordered participant pair for direct
/// messages, the group id for group messages. Direct System messages carry
/// no sender and are not indexable; they are delivery-only.
fn conversation_key(message: &ChatMessage) -> Option<ConversationKey> {
    match (&message.target, &message.sender) {
        (Target::Group(group_id), _) => Some(ConversationKey::group(group_id)),
        (Target::User(target), Some(sender)) => Some(ConversationKey::direct(sender, target)),
        (Target::User(_), None) => None,
    }
}
