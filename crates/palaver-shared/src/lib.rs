//! # palaver-shared
//!
//! Wire types shared between the Palaver chat server and its clients.
//!
//! The crate defines the identifier newtypes, the protocol envelopes
//! (`Message` push vs. `Request`/`Response` pairs) and the binary codec
//! helpers. It deliberately contains no I/O: both the server and any client
//! link against it to agree on the contract.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::*;
pub use types::{ConversationKey, GroupId, UserId};
