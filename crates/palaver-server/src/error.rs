use thiserror::Error;
use uuid::Uuid;

use palaver_shared::{Response, ResponseKind};
use palaver_store::StoreError;

/// Request-level failures. Each variant maps to exactly one failed
/// [`Response`]; none of them terminates the connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("recipient is offline")]
    RecipientOffline,

    #[error("unsupported request: {0}")]
    Unsupported(&'static str),

    #[error("message sender does not match the authenticated session")]
    SenderMismatch,

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl ServerError {
    /// Turn the error into the single failed response owed to the requester.
    pub fn into_response(self, request_id: Option<Uuid>, kind: ResponseKind) -> Response {
        Response::err(request_id, kind, self.to_string())
    }
}
