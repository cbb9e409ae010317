//! # Fleetlink SSH Transport
//!
//! One authenticated SSH connection per credential set, shared by every
//! request that targets the same host. From that connection the session
//! derives an SFTP client, exec channels for commands, a Docker Engine
//! client tunneled to the remote socket and a systemd bus connection.

#![warn(missing_docs)]

/// Connection credentials and the pool key
pub mod credentials;

/// Authenticated SSH session and its derived protocol clients
pub mod session;

/// Remote command execution with a hard timeout
pub mod exec;

/// Reference-counted connection pool with mark-and-sweep eviction
pub mod pool;

/// Docker Engine API over a tunneled unix socket
pub mod docker;

/// SFTP operations used by the file helpers
pub mod sftp;

/// SSH-specific error types
pub mod error;

pub use credentials::Credentials;
pub use session::{ServiceBus, SessionConfig, SshSession, SshTunnel, TunnelStream};
pub use exec::{run_command, CommandResult, ExecChannel, ExecEvent, TIMEOUT_MARKER};
pub use pool::{
    ConnectionHandle, ConnectionPool, Connector, PoolConfig, PoolStats, PooledSession, SshConnector,
};
pub use docker::{EngineClient, EngineResponse, TunnelDialer, COMPOSE_SERVICE_LABEL};
pub use sftp::{FileTransfer, RemoteMetadata};
pub use error::TransportError;
