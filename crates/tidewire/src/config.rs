//! Client configuration

use std::time::Duration;
use tidewire_proto::ProtocolConfig;
use uuid::Uuid;

/// Configuration of a [`Connection`](crate::Connection)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name of the client application, sent with every request
    pub client_name: Option<String>,
    /// Identity reported during the handshake
    pub identity: String,
    /// Credential for the server's auth provider
    pub credential: Option<String>,
    /// Codec limits
    pub protocol: ProtocolConfig,
    /// Reconnect after losing the link
    pub reconnect: bool,
    /// Delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Give up after this many failed attempts, 0 for unlimited
    pub max_reconnect_attempts: u32,
    /// How long calls wait for the link to open
    pub open_timeout: Duration,
    /// How long to wait for the server's handshake
    pub handshake_timeout: Duration,
    /// Fail requests without a response after this long
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            identity: Uuid::new_v4().to_string(),
            credential: None,
            protocol: ProtocolConfig::default(),
            reconnect: true,
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 0,
            open_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Set the client application name
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the identity reported to the server
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the credential
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Set codec limits; must match the server's
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Enable/disable automatic reconnect
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Limit reconnect attempts
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set how long calls wait for an open link
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set a per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
