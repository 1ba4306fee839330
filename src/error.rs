//! Error taxonomy shared by the registry, store, engine and sessions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Room name is empty, too long or contains non-word characters.
    #[error("invalid room name {name:?}: {reason}")]
    InvalidRoom { name: String, reason: &'static str },

    #[error("room {0} does not exist")]
    RoomNotFound(String),

    #[error("room {0} already exists")]
    RoomExists(String),

    #[error("message content is empty")]
    EmptyMessage,

    /// Persistence failed. Nothing was fanned out.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Push to a single connection failed. Never surfaced to the author.
    #[error("delivery to connection {connection} failed: {reason}")]
    DeliveryFailure { connection: String, reason: &'static str },

    #[error("relay publish failed: {0}")]
    RelayPublishFailure(String),

    #[error("operation not allowed while session is {0}")]
    InvalidState(&'static str),

    #[error("frame targets room {got} but connection is joined to {expected}")]
    RoomMismatch { expected: String, got: String },

    #[error("not logged in")]
    Unauthorized,
}

impl ChatError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(err.to_string())
    }

    pub fn relay(err: impl std::fmt::Display) -> Self {
        Self::RelayPublishFailure(err.to_string())
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err)
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
