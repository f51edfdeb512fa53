//! Error types for the Tidewire client

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tidewire_proto::{ErrorBody, ErrorCode, ProtocolError};
use tidewire_transport::TransportError;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-related errors, including loss of the link
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The server refused the handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server answered with an error response
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// The connection was closed locally
    #[error("Connection closed")]
    Closed,

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Whether the error came from losing the link
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Error details returned by the server, if any
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

/// Error carried by a failed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error code
    pub code: ErrorCode,
    /// Handler's error message
    pub message: String,
    /// Cause chain, when the server exposes it
    pub stack: Option<String>,
}

impl From<ErrorBody> for RemoteError {
    fn from(body: ErrorBody) -> Self {
        Self {
            code: body.code,
            message: body.message,
            stack: body.stack,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
