use crate::protocol::AnswerCode;
use thiserror::Error;

/// Result type for Arcam operations
pub type Result<T> = std::result::Result<T, ArcamError>;

/// Errors that can occur when talking to an Arcam receiver
#[derive(Error, Debug)]
pub enum ArcamError {
    /// The TCP connection could not be established or was lost
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// No matching response arrived before the command deadline
    #[error("Command timeout")]
    CommandTimeout,

    /// Another command is already waiting for its response
    #[error("A command is already in flight")]
    Busy,

    /// The command cannot be represented on the wire
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The receiver answered with a non-success answer code
    #[error("Device error: {0}")]
    Device(AnswerCode),

    /// Response payload did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArcamError {
    pub(crate) fn connection(message: impl std::fmt::Display) -> Self {
        Self::Connection {
            message: message.to_string(),
            source: None,
        }
    }

    /// Connection error caused by a socket operation
    pub(crate) fn io(message: impl std::fmt::Display, source: std::io::Error) -> Self {
        Self::Connection {
            message: format!("{}: {}", message, source),
            source: Some(source),
        }
    }
}
