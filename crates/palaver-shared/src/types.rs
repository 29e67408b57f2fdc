use serde::{Deserialize, Serialize};
use uuid::Uuid;

// User identity = BLAKE3 hash of the username (32 bytes).
//
// Deriving the id from the (case-sensitive) username means a reconnecting
// user re-derives the same id without a central allocator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub [u8; 32]);

impl UserId {
    /// Derive the id for a username.
    pub fn from_username(username: &str) -> Self {
        Self(*blake3::hash(username.as_bytes()).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Group identifier. The public room uses the well-known id `"public"`;
/// every other group gets a UUID v4 string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub String);

pub const PUBLIC_GROUP_ID: &str = "public";

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The well-known public room every user is joined to on login.
    pub fn public() -> Self {
        Self(PUBLIC_GROUP_ID.to_string())
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC_GROUP_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic index for message history.
///
/// Direct conversations hash to the same key regardless of who sent first:
/// the pair is ordered before formatting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm:{}:{}", lo.to_hex(), hi.to_hex()))
    }

    pub fn group(id: &GroupId) -> Self {
        Self(format!("grp:{}", id.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
