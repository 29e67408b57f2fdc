use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{GroupId, UserId};

/// Everything exchanged over a client connection.
///
/// `Message` is a push with no reply expected; `Request` and `Response` are
/// correlated by the request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    Message(ChatMessage),
    Request(Request),
    Response(Response),
}

impl Envelope {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    File,
    Video,
    /// Human-readable server notification ("alice joined the room").
    System,
    /// Machine-readable signal, never persisted or displayed verbatim.
    Control,
}

/// Opaque binary payload attached to a File/Image/Video message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub data: Vec<u8>,
}

/// Delivery target of a message. A sum type instead of an id + boolean pair,
/// so the router match is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Target {
    User(UserId),
    Group(GroupId),
}

/// A single chat message. Immutable once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub kind: MessageKind,
    /// Text content; also carries the human-readable text of System messages.
    pub content: String,
    /// Binary payload for File/Image/Video kinds.
    pub attachment: Option<Attachment>,
    /// None for System and Control messages.
    pub sender: Option<UserId>,
    pub target: Target,
    /// Structured payload for Control messages.
    pub control: Option<ControlSignal>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn text(sender: UserId, target: Target, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageKind::Text,
            content: content.into(),
            attachment: None,
            sender: Some(sender),
            target,
            control: None,
            timestamp: Utc::now(),
        }
    }

    /// Sender-less server notification, shown to users as-is.
    pub fn system(target: Target, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageKind::System,
            content: content.into(),
            attachment: None,
            sender: None,
            target,
            control: None,
            timestamp: Utc::now(),
        }
    }

    /// Sender-less control signal for client state management.
    pub fn control(target: Target, signal: ControlSignal) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageKind::Control,
            content: String::new(),
            attachment: None,
            sender: None,
            target,
            control: Some(signal),
            timestamp: Utc::now(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == MessageKind::Control
    }
}

/// In-band signals that previously travelled as magic string prefixes
/// embedded in message text. Typed so clients match instead of sniffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlSignal {
    /// A user went online or offline; clients should re-fetch the user list.
    StatusChanged { detail: String },
    /// Group membership changed somewhere; clients should re-fetch groups.
    RefreshGroups,
    /// Terminal notice: this session was replaced by a newer login.
    Evicted { reason: String },
    /// Invitation to join a group.
    GroupInvite {
        group_id: GroupId,
        group_name: String,
        inviter: UserId,
    },
}

// ---------------------------------------------------------------------------
// Identities and groups
// ---------------------------------------------------------------------------

/// A registered chat participant, independent of any connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub last_active_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: UserId::from_username(&username),
            username,
            last_active_at: Utc::now(),
        }
    }
}

/// A named set of users that receive group broadcasts together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub creator: UserId,
    pub members: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(name: impl Into<String>, creator: UserId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(creator);
        Self {
            id: GroupId::new(),
            name: name.into(),
            creator,
            members,
            created_at: Utc::now(),
        }
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub body: RequestBody,
    pub timestamp: DateTime<Utc>,
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            timestamp: Utc::now(),
        }
    }
}

/// Closed set of client requests. Adding a variant forces every dispatcher
/// match to be revisited at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    Login { username: String, password: String },
    Logout,
    SendMessage(ChatMessage),
    CreateGroup { name: String },
    JoinGroup { group_id: GroupId },
    LeaveGroup { group_id: GroupId },
    DissolveGroup { group_id: GroupId },
    InviteToGroup { group_id: GroupId, invitee: UserId },
    GetUsers,
    GetGroups,
    GetHistory { target: Target, limit: Option<u32> },
    Heartbeat,
    /// Declared by the protocol but not served; always rejected.
    TransferFile,
    /// Declared by the protocol but not served; always rejected.
    VoiceCall,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseKind {
    LoginResult,
    LogoutResult,
    MessageResult,
    GroupResult,
    UserList,
    GroupList,
    HistoryMessages,
    FileResult,
    GenericResult,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers; None for unsolicited responses.
    pub request_id: Option<Uuid>,
    pub kind: ResponseKind,
    pub success: bool,
    pub message: String,
    pub payload: Option<ResponsePayload>,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn ok(
        request_id: Option<Uuid>,
        kind: ResponseKind,
        message: impl Into<String>,
        payload: Option<ResponsePayload>,
    ) -> Self {
        Self {
            request_id,
            kind,
            success: true,
            message: message.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn err(request_id: Option<Uuid>, kind: ResponseKind, message: impl Into<String>) -> Self {
        Self {
            request_id,
            kind,
            success: false,
            message: message.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Login snapshot, delivered as one atomic payload so the client never
    /// races separate follow-up fetches.
    LoginOk {
        profile: UserProfile,
        public_group: Group,
        member_groups: Vec<Group>,
    },
    Users(Vec<UserProfile>),
    Groups(Vec<Group>),
    Group(Group),
    History(Vec<ChatMessage>),
}
