//! Error types for vaultchat core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using vaultchat Error
pub type Result<T> = std::result::Result<T, Error>;

/// vaultchat error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session {0} is already processing a turn")]
    AlreadyProcessing(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session {id}: {reason}")]
    SessionInvalid { id: String, reason: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable wire code for this error when surfaced as an `error` event
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::AlreadyProcessing(_) => ErrorCode::AlreadyProcessing,
            Error::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Error::SessionInvalid { .. } => ErrorCode::SessionInvalid,
            _ => ErrorCode::SdkError,
        }
    }
}

/// Error codes carried by `SessionEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The agent turn client failed to start or failed mid-stream
    SdkError,
    /// Resume requested for a session the store does not know
    SessionNotFound,
    /// Resume requested for a session that is unreadable or bound elsewhere
    SessionInvalid,
    AlreadyProcessing,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::SdkError => write!(f, "SDK_ERROR"),
            ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
            ErrorCode::SessionInvalid => write!(f, "SESSION_INVALID"),
            ErrorCode::AlreadyProcessing => write!(f, "ALREADY_PROCESSING"),
        }
    }
}
