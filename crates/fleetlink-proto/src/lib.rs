//! # Fleetlink Protocol
//!
//! The subset of the D-Bus wire protocol fleetlink needs to talk to a
//! service manager over a tunneled socket: typed values, marshalling,
//! message framing and the SASL `EXTERNAL` handshake.

#![warn(missing_docs)]

/// Type signatures and values
pub mod value;

/// Low-level marshalling with D-Bus alignment rules
pub mod frame;

/// Message headers and bodies
pub mod message;

/// Message codec for async streams
pub mod codec;

/// SASL authentication handshake
pub mod auth;

/// Serialized method calls over one stream
pub mod connection;

/// Error types for protocol operations
pub mod error;

pub use value::{parse_signature, Type, Value};
pub use frame::{Decoder, Encoder};
pub use message::{Message, MessageType};
pub use codec::MessageCodec;
pub use auth::authenticate_external;
pub use connection::BusConnection;
pub use error::ProtocolError;
