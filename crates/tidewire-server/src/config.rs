//! Server configuration

use std::time::Duration;
use tidewire_proto::ProtocolConfig;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Codec limits applied to every session
    pub protocol: ProtocolConfig,
    /// Interval of the liveness sweep
    pub heartbeat_interval: Duration,
    /// How long a new connection may take to report its identity
    pub handshake_timeout: Duration,
    /// Outbound messages queued per session before pushes are dropped
    pub outbound_buffer: usize,
    /// Attach error cause chains to error responses
    pub expose_error_details: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            outbound_buffer: 1024,
            expose_error_details: false,
        }
    }
}

impl ServerConfig {
    /// Set the protocol limits
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-session outbound queue size
    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size;
        self
    }

    /// Enable or disable cause chains in error responses
    pub fn with_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }
}
