//! Error types for the Fleetlink library

use crate::systemd::ServiceOperation;
use fleetlink_ssh::TransportError;
use thiserror::Error;

/// Who can act on an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong; retrying unchanged will fail again
    Caller,
    /// The remote host or one of its daemons failed
    Target,
    /// The gateway failed
    Internal,
}

/// Main error type for Fleetlink operations
#[derive(Debug, Error)]
pub enum FleetlinkError {
    /// No session could be obtained for the target
    #[error("Connection to {target} failed: {source}")]
    Connection {
        /// `user@host` of the target
        target: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Command could not be run to completion
    #[error("Command '{command}' failed: {source}")]
    Command {
        /// Command text
        command: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// File could not be read
    #[error("Could not read {path}: {source}")]
    FileRead {
        /// Remote path
        path: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// File could not be written
    #[error("Could not write {path}: {source}")]
    FileWrite {
        /// Remote path
        path: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// File could not be deleted
    #[error("Could not delete {path}: {source}")]
    FileDelete {
        /// Remote path
        path: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Path is a directory where a file was expected
    #[error("{0} is a directory")]
    IsDirectory(String),

    /// File exceeds the read limit
    #[error("File {path} too big ({size} bytes > {max} bytes allowed)")]
    FileTooBig {
        /// Remote path
        path: String,
        /// Actual size in bytes
        size: u64,
        /// Allowed size in bytes
        max: u64,
    },

    /// A file sits where a directory is needed
    #[error("Cannot create directory {0} because a file exists at that path")]
    NotADirectory(String),

    /// Service manager connection could not be established
    #[error("Service manager connection failed: {0}")]
    ServiceBus(#[source] TransportError),

    /// A service manager call failed
    #[error("Could not {operation} {unit}: {message}")]
    Service {
        /// What was attempted
        operation: ServiceOperation,
        /// Unit name
        unit: String,
        /// Service manager message
        message: String,
    },

    /// Docker Engine request failed
    #[error("Docker Engine request for {target} failed: {source}")]
    Container {
        /// Container id or the listing that was requested
        target: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Request is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other transport errors
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FleetlinkError {
    /// Classify the error for status reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetlinkError::IsDirectory(_)
            | FleetlinkError::FileTooBig { .. }
            | FleetlinkError::NotADirectory(_)
            | FleetlinkError::InvalidRequest(_) => ErrorKind::Caller,

            FleetlinkError::Connection { source, .. } => match source {
                TransportError::InvalidCredentials(_) | TransportError::InvalidKey(_) => {
                    ErrorKind::Caller
                }
                _ => ErrorKind::Target,
            },

            FleetlinkError::FileRead { source, .. }
            | FleetlinkError::FileDelete { source, .. } => match source {
                TransportError::NotFound(_) => ErrorKind::Caller,
                _ => ErrorKind::Target,
            },

            FleetlinkError::Container { source, .. } => match source {
                TransportError::Engine { status, .. } if (400..500).contains(status) => {
                    ErrorKind::Caller
                }
                TransportError::InvalidContainerId(_) => ErrorKind::Caller,
                _ => ErrorKind::Target,
            },

            FleetlinkError::Command { .. }
            | FleetlinkError::FileWrite { .. }
            | FleetlinkError::ServiceBus(_)
            | FleetlinkError::Service { .. } => ErrorKind::Target,

            FleetlinkError::Transport(TransportError::Cancelled) => ErrorKind::Internal,
            FleetlinkError::Transport(_) => ErrorKind::Target,
        }
    }

    /// Machine-readable problem type
    pub fn problem_type(&self) -> &'static str {
        match self {
            FleetlinkError::Connection { .. } => "connection_err",
            FleetlinkError::Command { .. } => "command_err",
            FleetlinkError::FileRead { .. } => "file_read",
            FleetlinkError::FileWrite { .. } => "file_write",
            FleetlinkError::FileDelete { .. } => "file_delete",
            FleetlinkError::IsDirectory(_) => "path_is_directory",
            FleetlinkError::FileTooBig { .. } => "file_too_big",
            FleetlinkError::NotADirectory(_) => "folder_create",
            FleetlinkError::ServiceBus(_) => "systemd_connection_err",
            FleetlinkError::Service { operation, .. } => operation.problem_type(),
            FleetlinkError::Container { .. } => "command_err",
            FleetlinkError::InvalidRequest(_) => "invalid_request",
            FleetlinkError::Transport(_) => "transport_err",
        }
    }

    /// Short human-readable title
    pub fn title(&self) -> &'static str {
        match self {
            FleetlinkError::Connection { .. } => "Connection to target host failed",
            FleetlinkError::Command { .. } => "Command failed",
            FleetlinkError::FileRead { .. }
            | FleetlinkError::IsDirectory(_)
            | FleetlinkError::FileTooBig { .. } => "Could not read file",
            FleetlinkError::FileWrite { .. } => "Could not write file",
            FleetlinkError::FileDelete { .. } => "Could not delete file",
            FleetlinkError::NotADirectory(_) => "Could not create parent folder",
            FleetlinkError::ServiceBus(_) => "Systemd connection error",
            FleetlinkError::Service { operation, .. } => operation.title(),
            FleetlinkError::Container { .. } => "Docker Engine error",
            FleetlinkError::InvalidRequest(_) => "Invalid request",
            FleetlinkError::Transport(_) => "Transport error",
        }
    }
}
