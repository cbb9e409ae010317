//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Signature string could not be parsed
    #[error("Invalid signature '{0}'")]
    InvalidSignature(String),

    /// Message bytes do not follow the wire format
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message exceeds the configured limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Peer refused the offered authentication mechanism
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Peer answered the handshake with something unexpected
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Remote method returned an error reply
    #[error("{name}: {message}")]
    MethodError {
        /// D-Bus error name
        name: String,
        /// Human readable message, empty when the reply had no body
        message: String,
    },

    /// Stream ended while a reply was outstanding
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::InvalidMessage`]
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }
}
