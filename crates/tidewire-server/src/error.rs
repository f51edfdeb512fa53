//! Server error types

use std::time::Duration;
use thiserror::Error;
use tidewire_proto::ProtocolError;
use tidewire_transport::TransportError;

/// Server-side errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid service table
    #[error("Registration error: {0}")]
    Registration(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Codec failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Peer did not report its identity in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Credential refused by the auth provider
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Session is gone
    #[error("Session closed")]
    SessionClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
