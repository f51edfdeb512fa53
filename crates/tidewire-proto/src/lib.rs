//! # Tidewire Protocol
//!
//! Wire format, message types, chunking codec and reassembly for the
//! Tidewire request/response and event transport.

#![warn(missing_docs)]

/// Frame structure and header layout
pub mod frame;

/// Message types and enums
pub mod message;

/// Control and service command names
pub mod command;

/// Size limits and timing of the codec
pub mod config;

/// Reassembly of split messages
pub mod reassembly;

/// Message codec with chunking
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{Decoded, MessageCodec};
pub use command::ControlRequest;
pub use config::ProtocolConfig;
pub use error::ProtocolError;
pub use frame::{Frame, HEADER_SIZE};
pub use message::{
    Broadcast, ErrorBody, ErrorCode, Event, IdentityReply, ListenerInfo, ListenerKey, Message,
    Progress, Request, Response, ResponseState,
};
pub use reassembly::{PushOutcome, ReassemblyStore};
