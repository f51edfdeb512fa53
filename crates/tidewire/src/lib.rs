//! # Tidewire
//!
//! Client for the Tidewire transport: call server methods by name, receive
//! typed results and subscribe to filtered push events over one persistent
//! link.
//!
//! ```no_run
//! use serde_json::json;
//! use tidewire::{ClientConfig, Connection};
//!
//! # async fn demo() -> tidewire::Result<()> {
//! let connection = Connection::open("ws://127.0.0.1:7600", ClientConfig::default()).await?;
//! let greeting: String = connection.call("Echo.say", vec![json!("hi")]).await?;
//!
//! connection
//!     .add_event_listener("Notify", json!({"room": "A"}), |payload| async move {
//!         println!("notified: {}", payload);
//!         Ok::<(), anyhow::Error>(())
//!     })
//!     .await?;
//! connection.emit("Notify", |filter| filter["room"] == "A", json!(greeting)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tidewire_proto as proto;
pub use tidewire_transport as transport;

/// Error types for the Tidewire client
pub mod error;

/// Client configuration
pub mod config;

/// Connection state machine and client API
pub mod connection;

/// Request/response correlation
pub mod router;

/// Local listener bookkeeping
mod events;

pub use config::ClientConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::{ClientError, RemoteError};
pub use events::EventCallback;
pub use router::{Direction, ProgressFn, TransferProgress};
pub use tidewire_proto::ListenerKey;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
