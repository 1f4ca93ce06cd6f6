/// Real-time collaborative session engine for mindmap documents.
/// One actor per room serializes every document mutation; clients apply
/// optimistically and reconcile against the authoritative echo.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod access;
pub use access::*;

mod operations;
pub use operations::*;

mod presence;
pub use presence::*;

mod history;
pub use history::*;

mod config;
pub use config::*;

mod store;
pub use store::*;

mod sync;
pub use sync::*;

mod room;
pub use room::*;

mod server;
pub use server::*;

mod events;
pub use events::*;

mod replica;
pub use replica::*;

mod client;
pub use client::*;

use mindmap::MindmapError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaborationError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("access revoked: {0}")]
    AccessRevoked(String),

    #[error("insufficient access: {0}")]
    InsufficientAccess(String),

    #[error("nothing to {0}")]
    NoOp(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("reconnect failed after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("room closed: {0}")]
    RoomClosed(String),

    #[error("operation conflict: {0}")]
    Conflict(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(String),
}

impl CollaborationError {
    /// Stable identifier used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "access_denied",
            Self::RoomNotFound(_) => "room_not_found",
            Self::AccessRevoked(_) => "access_revoked",
            Self::InsufficientAccess(_) => "insufficient_access",
            Self::NoOp(_) => "no_op",
            Self::TransientNetwork(_) => "transient_network",
            Self::ReconnectExhausted(_) => "reconnect_exhausted",
            Self::RoomClosed(_) => "room_closed",
            Self::Conflict(_) => "conflict",
            Self::InvalidOp(_) => "invalid_op",
            Self::Serialization(_) => "serialization",
            Self::Store(_) => "store",
        }
    }

    /// Rebuilds an error received as `{code, message}`, where `message`
    /// is the rendered error.
    pub fn from_wire(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let build: fn(String) -> Self = match code {
            "access_denied" => Self::AccessDenied,
            "room_not_found" => Self::RoomNotFound,
            "access_revoked" => Self::AccessRevoked,
            "insufficient_access" => Self::InsufficientAccess,
            "no_op" => Self::NoOp,
            "transient_network" => Self::TransientNetwork,
            "reconnect_exhausted" => {
                let attempts = message
                    .split_whitespace()
                    .find_map(|word| word.parse().ok())
                    .unwrap_or_default();
                return Self::ReconnectExhausted(attempts);
            }
            "room_closed" => Self::RoomClosed,
            "conflict" => Self::Conflict,
            "invalid_op" => Self::InvalidOp,
            "serialization" => Self::Serialization,
            "store" => Self::Store,
            _ => Self::InvalidOp,
        };
        let prefix = build(String::new()).to_string();
        match message.strip_prefix(prefix.as_str()) {
            Some(detail) => build(detail.to_string()),
            None => build(message),
        }
    }

    /// Only dropped connections are worth retrying without user action.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::RoomClosed(_))
    }

    /// Errors that end a join attempt and must be shown to the user.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied(_) | Self::RoomNotFound(_) | Self::AccessRevoked(_)
        )
    }
}

impl From<MindmapError> for CollaborationError {
    fn from(err: MindmapError) -> Self {
        match err {
            MindmapError::HistoryEmpty(stack) => {
                Self::NoOp(stack.trim_end_matches(" stack").to_string())
            }
            MindmapError::NodeExists(_) | MindmapError::EdgeExists(_) => {
                Self::Conflict(err.to_string())
            }
            other => Self::InvalidOp(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identity as supplied by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Internal document id; rooms are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One connection's membership in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_round_trip() {
        let errors = [
            CollaborationError::AccessDenied("x".into()),
            CollaborationError::RoomNotFound("x".into()),
            CollaborationError::AccessRevoked("x".into()),
            CollaborationError::InsufficientAccess("x".into()),
            CollaborationError::NoOp("undo".into()),
            CollaborationError::TransientNetwork("reset".into()),
            CollaborationError::ReconnectExhausted(5),
            CollaborationError::RoomClosed("doc".into()),
            CollaborationError::Conflict("x".into()),
            CollaborationError::InvalidOp("x".into()),
            CollaborationError::Serialization("x".into()),
            CollaborationError::Store("x".into()),
        ];
        for err in errors {
            let rebuilt = CollaborationError::from_wire(err.code(), err.to_string());
            assert_eq!(rebuilt.to_string(), err.to_string());
            assert_eq!(rebuilt, err);
        }

        assert_eq!(
            CollaborationError::from_wire("mystery", "boom"),
            CollaborationError::InvalidOp("boom".into())
        );
    }

    #[test]
    fn test_history_empty_maps_to_no_op() {
        let err = CollaborationError::from(MindmapError::HistoryEmpty("undo stack"));
        assert_eq!(err, CollaborationError::NoOp("undo".into()));
        assert_eq!(err.to_string(), "nothing to undo");
        assert!(!err.is_retriable());
    }
}
