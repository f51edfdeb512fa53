//! Transport abstraction

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// One message on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Binary frame carrying protocol data
    Binary(Bytes),
    /// Liveness probe
    Ping(Bytes),
    /// Answer to a ping
    Pong(Bytes),
    /// Orderly close
    Close,
}

/// Sending half of a transport
#[async_trait]
pub trait WireSink: Send {
    /// Send one message
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Close the link
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a transport
#[async_trait]
pub trait WireStream: Send {
    /// Receive the next message, `None` once the link is gone
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>>;
}

/// Client-side factory for transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport to the server
    async fn connect(&self) -> Result<Transport, TransportError>;

    /// Human-readable target, used in logs
    fn target(&self) -> String;
}

/// Server-side source of incoming transports
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next incoming transport
    async fn accept(&mut self) -> Result<Transport, TransportError>;
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Address of the peer, when it has one
    pub remote_addr: Option<SocketAddr>,
    /// Connection type
    pub transport_type: TransportType,
}

impl ConnectionInfo {
    /// Information for a WebSocket peer
    pub fn websocket(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            transport_type: TransportType::WebSocket,
        }
    }

    /// Information for an in-process peer
    pub fn memory() -> Self {
        Self {
            remote_addr: None,
            transport_type: TransportType::Memory,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.transport_type, self.remote_addr) {
            (_, Some(addr)) => write!(f, "{}", addr),
            (TransportType::WebSocket, None) => f.write_str("websocket"),
            (TransportType::Memory, None) => f.write_str("memory"),
        }
    }
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket over TCP
    WebSocket,
    /// In-process channel pair
    Memory,
}

/// A bidirectional message link
pub struct Transport {
    sink: Box<dyn WireSink>,
    stream: Box<dyn WireStream>,
    info: ConnectionInfo,
}

impl Transport {
    /// Assemble a transport from its halves
    pub fn new(sink: Box<dyn WireSink>, stream: Box<dyn WireStream>, info: ConnectionInfo) -> Self {
        Self { sink, stream, info }
    }

    /// Get connection information
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Send one message
    pub async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        self.sink.send(message).await
    }

    /// Receive the next message
    pub async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        self.stream.next_message().await
    }

    /// Split into independently owned halves
    pub fn split(self) -> (Box<dyn WireSink>, Box<dyn WireStream>, ConnectionInfo) {
        (self.sink, self.stream, self.info)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("info", &self.info).finish()
    }
}
