//! Shared fixtures: a real server with demo services

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tidewire::{ClientConfig, Connection};
use tidewire_server::{handler_fn, Server, ServerConfig, ServiceTable};
use tidewire_transport::memory::{self, MemoryConnector};
use tracing_subscriber::EnvFilter;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Services every fixture server exposes
pub fn services() -> ServiceTable {
    ServiceTable::builder()
        .method(
            "Echo",
            "say",
            handler_fn(|params: Vec<Value>| async move {
                Ok(params.into_iter().next().unwrap_or(Value::Null))
            }),
        )
        .method(
            "Echo",
            "len",
            handler_fn(|params: Vec<Value>| async move {
                let text = params.first().and_then(Value::as_str).unwrap_or_default();
                Ok(json!(text.len()))
            }),
        )
        .method(
            "Echo",
            "blob",
            handler_fn(|params: Vec<Value>| async move {
                let size = params.first().and_then(Value::as_u64).unwrap_or(0) as usize;
                Ok(json!("z".repeat(size)))
            }),
        )
        .method(
            "Echo",
            "fail",
            handler_fn(|_params: Vec<Value>| async move {
                Err(anyhow::anyhow!("handler exploded"))
            }),
        )
        .method(
            "Echo",
            "hang",
            handler_fn(|_params: Vec<Value>| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }),
        )
        .build()
        .expect("valid service table")
}

/// Server reachable through the in-memory transport
pub fn memory_server(config: ServerConfig) -> (Server, MemoryConnector) {
    let server = Server::builder()
        .with_config(config)
        .with_services(services())
        .build()
        .expect("server builds");
    let (connector, listener) = memory::listener();
    server.serve(listener);
    (server, connector)
}

/// Client config with a fixed identity and fast reconnects
pub fn client_config(identity: &str) -> ClientConfig {
    ClientConfig::default()
        .with_identity(identity)
        .with_client_name("tests")
        .with_reconnect_delay(Duration::from_millis(50))
}

/// Route logs to the test harness, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connect a client through a memory connector
pub async fn connect(connector: &MemoryConnector, config: ClientConfig) -> Connection {
    init_tracing();
    Connection::connect(Arc::new(connector.clone()), config)
        .await
        .expect("client connects")
}

/// Poll `condition` until it holds or [`WAIT`] passes
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
