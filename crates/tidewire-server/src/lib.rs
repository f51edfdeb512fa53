//! # Tidewire Server
//!
//! Accepts transports, runs the identity handshake, keeps one live session per
//! identity, dispatches `Service.method` requests to registered handlers and
//! fans events out to filtered listener registrations.

#![warn(missing_docs)]

/// Server configuration
pub mod config;

/// Server error types
pub mod error;

/// Handshake identity validation
pub mod auth;

/// Service handlers and routing table
pub mod service;

/// Per-connection sessions
pub mod session;

/// Live session registry
pub mod registry;

/// Listener registrations and event fan-out
pub mod listeners;

/// Liveness sweep
pub mod heartbeat;

/// Request dispatch
pub mod dispatcher;

/// Server instance
pub mod server;

pub use auth::{AllowAll, AuthProvider, Principal};
pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use error::ServerError;
pub use listeners::ListenerRegistry;
pub use registry::SessionRegistry;
pub use server::{Server, ServerBuilder};
pub use service::{handler_fn, HandlerResolver, ServiceHandler, ServiceTable, ServiceTableBuilder};
pub use session::{Session, SessionHandle};

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;
