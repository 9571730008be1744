//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering framing and (de)serialization failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message body.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message body.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
