//! # Tidewire Transport
//!
//! Message-oriented binary transports for Tidewire. A transport carries whole
//! binary messages plus ping/pong control frames; framing of logical messages
//! happens above this layer.

#![warn(missing_docs)]

/// Transport abstraction
pub mod transport;

/// WebSocket transport over TCP
pub mod websocket;

/// In-process transport for tests and embedding
pub mod memory;

/// Transport error types
pub mod error;

pub use error::TransportError;
pub use memory::{MemoryConnector, MemoryListener};
pub use transport::{
    Acceptor, ConnectionInfo, Connector, Transport, TransportType, WireMessage, WireSink,
    WireStream,
};
pub use websocket::{WsConnector, WsListener};
