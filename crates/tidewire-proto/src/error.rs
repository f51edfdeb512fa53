//! Error types for protocol operations

use thiserror::Error;
use uuid::Uuid;
use crate::message::{ErrorBody, ErrorCode};

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed frame (short header, inconsistent chunk metadata)
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Declared or actual payload is over the configured maximum
    #[error("Message {correlation_id} too large: {size} bytes (max: {max})")]
    SizeLimitExceeded {
        /// Correlation id of the offending message
        correlation_id: Uuid,
        /// Declared or actual size
        size: u64,
        /// Maximum allowed size
        max: u64
    },

    /// Invalid configuration values
    #[error("Invalid protocol configuration: {0}")]
    InvalidConfig(String),
}

impl ProtocolError {
    /// Correlation id the error is attached to, when the header could be read
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::SizeLimitExceeded { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}

impl From<ProtocolError> for ErrorBody {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::SizeLimitExceeded { size, max, .. } => {
                ErrorBody::new(
                    ErrorCode::PayloadTooLarge,
                    format!("Message size exceeds the limit: {} bytes (max: {})", size, max),
                )
            }
            other => ErrorBody::new(ErrorCode::BadCommand, other.to_string()),
        }
    }
}
