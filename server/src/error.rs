//! Command-level error mapping onto reply statuses.

use serde_json::{json, Value};
use wsn_common::FrameError;

use crate::auth::AuthError;
use crate::images::ImageError;
use crate::store::StoreError;

/// Failure of a client command, rendered as a `{message, status}` reply.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("INVALID TOKEN")]
    InvalidToken,
    #[error("INVALID SLOT")]
    InvalidSlot,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    /// The payload could not be decoded; no reply is sent.
    #[error("Malformed payload: {0}")]
    Decode(#[from] FrameError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AuthError> for CommandError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken(_) => CommandError::InvalidToken,
            other => CommandError::Internal(other.to_string()),
        }
    }
}

impl CommandError {
    pub fn status(&self) -> u16 {
        match self {
            CommandError::InvalidToken | CommandError::Unauthorized(_) => 401,
            CommandError::InvalidSlot | CommandError::Conflict(_) => 403,
            CommandError::NotFound(_) => 404,
            CommandError::Image(ImageError::InvalidName(_)) => 400,
            CommandError::Decode(_) => 400,
            CommandError::Store(_)
            | CommandError::Image(_)
            | CommandError::Io(_)
            | CommandError::Internal(_) => 500,
        }
    }

    /// Reply body for the client, or `None` when the request is dropped silently.
    pub fn into_reply(self) -> Option<Value> {
        let status = self.status();
        match self {
            CommandError::Decode(_) => None,
            CommandError::Store(_)
            | CommandError::Io(_)
            | CommandError::Image(ImageError::Io(_))
            | CommandError::Internal(_) => Some(json!({
                "message": "Internal error",
                "status": status,
            })),
            CommandError::NotFound(_) => Some(json!({ "status": status })),
            other => Some(json!({
                "message": other.to_string(),
                "status": status,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_token_reply() {
        let reply = CommandError::InvalidToken.into_reply().unwrap();
        assert_eq!(reply, json!({"message": "INVALID TOKEN", "status": 401}));
    }

    #[test]
    fn test_invalid_slot_reply() {
        let reply = CommandError::InvalidSlot.into_reply().unwrap();
        assert_eq!(reply, json!({"message": "INVALID SLOT", "status": 403}));
    }

    #[test]
    fn test_auth_errors_become_invalid_token() {
        let err: CommandError = AuthError::InvalidToken("expired".to_string()).into();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_token_encoding_failure_is_internal() {
        let err: CommandError = AuthError::Encoding("bad key".to_string()).into();
        assert_eq!(err.status(), 500);
        assert_eq!(err.into_reply().unwrap()["message"], "Internal error");
    }

    #[test]
    fn test_decode_failure_has_no_reply() {
        let err = CommandError::Decode(FrameError::Json("eof".to_string()));
        assert!(err.into_reply().is_none());
    }

    #[test]
    fn test_storage_details_are_not_leaked() {
        let err = CommandError::Store(StoreError::Database("disk I/O error".to_string()));
        assert_eq!(err.status(), 500);
        let reply = err.into_reply().unwrap();
        assert_eq!(reply["message"], "Internal error");
    }
}
