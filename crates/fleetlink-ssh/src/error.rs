//! SSH-specific error types

use fleetlink_proto::ProtocolError;
use std::io;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Credentials are incomplete or malformed
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Private key could not be decoded
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// TCP dial or SSH handshake failed
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Server rejected every offered authentication method
    #[error("Authentication failed for {0}")]
    Authentication(String),

    /// Connect did not finish within the configured timeout
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Channel open or request was refused
    #[error("Channel error: {0}")]
    Channel(String),

    /// SFTP operation failed
    #[error("SFTP error on {path}: {message}")]
    Sftp {
        /// Remote path the operation targeted
        path: String,
        /// Server or client message
        message: String,
    },

    /// Remote path does not exist
    #[error("No such file: {0}")]
    NotFound(String),

    /// Command could not be run to completion
    #[error("Command '{command}' failed: {message}")]
    CommandFailed {
        /// Command text
        command: String,
        /// What went wrong
        message: String,
    },

    /// Remote output could not be interpreted
    #[error("Unexpected output from '{command}': {output}")]
    UnexpectedOutput {
        /// Command text
        command: String,
        /// Trimmed output
        output: String,
    },

    /// Docker Engine request failed before a response arrived
    #[error("Docker Engine request failed: {0}")]
    EngineRequest(String),

    /// Container id cannot name a container
    #[error("Invalid container id '{0}'")]
    InvalidContainerId(String),

    /// Docker Engine answered with an error status
    #[error("Docker Engine returned {status}: {message}")]
    Engine {
        /// HTTP status code
        status: u16,
        /// Engine error message
        message: String,
    },

    /// Service manager bus failed
    #[error("Service manager error: {0}")]
    Bus(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Session was closed
    #[error("Session is closed")]
    Closed,

    /// Caller gave up before the operation finished
    #[error("Operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether the error came from dialing or authenticating rather than from a live session
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidCredentials(_)
                | TransportError::InvalidKey(_)
                | TransportError::Connection(_)
                | TransportError::Authentication(_)
                | TransportError::Timeout(_)
        )
    }
}
