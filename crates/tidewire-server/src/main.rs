//! Tidewire Server Binary
//!
//! Demo server exposing an `Echo` service over WebSocket.

use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;
use tidewire_server::{handler_fn, Server, ServerConfig, ServiceTable};
use tracing::info;

const DEFAULT_ADDR: &str = "127.0.0.1:7600";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::var("TIDEWIRE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

    let services = ServiceTable::builder()
        .method(
            "Echo",
            "say",
            handler_fn(|params: Vec<Value>| async move {
                Ok(params.into_iter().next().unwrap_or(Value::Null))
            }),
        )
        .method(
            "Echo",
            "delay",
            handler_fn(|params: Vec<Value>| async move {
                let millis = params
                    .first()
                    .and_then(Value::as_u64)
                    .context("expected delay in milliseconds")?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Value::from(millis))
            }),
        )
        .build()?;

    info!("Starting Tidewire server with {} methods", services.len());
    let server = Server::builder()
        .with_config(ServerConfig::default())
        .with_services(services)
        .build()?;

    let local_addr = server
        .listen(addr.as_str())
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;
    info!("Ready on ws://{}", local_addr);

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;

    info!("Shutting down");
    server.close();
    Ok(())
}
