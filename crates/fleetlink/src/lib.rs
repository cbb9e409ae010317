//! # Fleetlink
//!
//! Remote administration of a fleet of hosts over pooled SSH sessions.
//!
//! A [`Gateway`] owns the connection pool. Callers acquire a session for a
//! set of credentials and drive it directly or through the capability
//! adapters: systemd units, remote files and Docker containers.

#![warn(missing_docs)]

pub use fleetlink_proto as proto;
pub use fleetlink_ssh as ssh;

/// Error types for the Fleetlink library
pub mod error;

/// Pool-backed entry point
pub mod gateway;

/// systemd unit inspection and control
pub mod systemd;

/// Remote file helpers
pub mod files;

/// Docker container listing and event streams
pub mod containers;

pub use error::{ErrorKind, FleetlinkError};
pub use gateway::{Gateway, GatewayOptions};
pub use systemd::{ServiceManager, ServiceOperation, ServiceStatus};
pub use files::{FileContents, RemoteFs, RemoteShell};
pub use containers::LineStream;

/// Result type alias for Fleetlink operations
pub type Result<T> = std::result::Result<T, FleetlinkError>;
