//! Message types and enums

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Top-level logical message, carried by one or more frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message
    Response(Response),
    /// Pushed event for a registered listener
    Event(Event),
    /// Receive progress of a split request, sent back to its sender
    Progress(Progress),
    /// Server asks the client to report its identity
    IdentityRequest,
    /// Client reports its identity
    IdentityReply(IdentityReply),
    /// Server accepted the identity; the session is live
    ConnectedAck,
    /// Server refused the identity or credential
    HandshakeRejected {
        /// Why the handshake was refused
        reason: String,
    },
    /// Server-wide notification
    Broadcast(Broadcast),
}

impl Message {
    /// Create a request message
    pub fn request(req: Request) -> Self {
        Self::Request(req)
    }

    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }

    /// Get the request id if this is a request or response
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::Request(req) => Some(req.id),
            Self::Response(resp) => Some(resp.request_id),
            Self::Progress(progress) => Some(progress.correlation_id),
            _ => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::Progress(_) => "progress",
            Self::IdentityRequest => "identity-request",
            Self::IdentityReply(_) => "identity-reply",
            Self::ConnectedAck => "connected-ack",
            Self::HandshakeRejected { .. } => "handshake-rejected",
            Self::Broadcast(_) => "broadcast",
        }
    }
}

/// Call of a service method or control command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed by the response
    pub id: Uuid,
    /// Name of the calling client application
    pub client_name: Option<String>,
    /// `Service.method` or a control command name
    pub command: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl Request {
    /// Create a request with a fresh id
    pub fn new(command: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_name: None,
            command: command.into(),
            params,
        }
    }

    /// Attach the calling client's name
    pub fn with_client_name(mut self, name: Option<String>) -> Self {
        self.client_name = name;
        self
    }
}

/// Result of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Request this responds to
    pub request_id: Uuid,
    /// Success body or error details
    pub state: ResponseState,
}

/// Outcome carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseState {
    /// The call succeeded
    Success(Value),
    /// The call failed
    Error(ErrorBody),
}

impl Response {
    /// Create a success response
    pub fn success(request_id: Uuid, body: Value) -> Self {
        Self {
            request_id,
            state: ResponseState::Success(body),
        }
    }

    /// Create an error response
    pub fn error(request_id: Uuid, error: ErrorBody) -> Self {
        Self {
            request_id,
            state: ResponseState::Error(error),
        }
    }

    /// Check if the response carries an error
    pub fn is_error(&self) -> bool {
        matches!(self.state, ResponseState::Error(_))
    }
}

/// Server-issued key of a listener registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerKey(pub String);

impl ListenerKey {
    /// Generate a fresh, collision-free key
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListenerKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Key and filter of one registration, as returned by a listener query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerInfo {
    /// Registration key
    pub key: ListenerKey,
    /// Filter payload supplied at registration
    pub filter: Value,
}

/// Event pushed to one listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Listener the event is for
    pub key: ListenerKey,
    /// Event payload
    pub payload: Value,
}

/// Reassembly progress of one correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Message being reassembled
    pub correlation_id: Uuid,
    /// Bytes received so far
    pub received: u64,
    /// Declared total size
    pub total: u64,
}

/// Identity reported by a client during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityReply {
    /// Stable client identity; one live session per identity
    pub identity: String,
    /// Name of the client application
    pub client_name: Option<String>,
    /// Credential for the server's auth provider
    pub credential: Option<String>,
}

/// Server-wide notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Broadcast {
    /// Files of a client application changed
    Reload {
        /// Target client application, `None` for all
        client_name: Option<String>,
        /// Changed file paths
        changed_files: Vec<String>,
    },
}

/// Error details for error responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Cause chain, when the server exposes it
    pub stack: Option<String>,
}

impl ErrorBody {
    /// Create new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack / cause chain
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Error codes for error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Command is not a known method or control command
    BadCommand,
    /// Referenced entity does not exist
    NotFound,
    /// Handler failed
    InternalError,
    /// Message over the size limit
    PayloadTooLarge,
    /// Caller is not allowed to do this
    Unauthorized,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BadCommand => "BAD_COMMAND",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Unauthorized => "UNAUTHORIZED",
        };
        f.write_str(name)
    }
}
