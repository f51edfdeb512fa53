//! Client against a real server over WebSocket on loopback

mod common;

use common::{client_config, init_tracing, services, WAIT};
use serde_json::json;
use std::time::Duration;
use tidewire::{Connection, ConnectionState};
use tidewire_server::{Server, ServerConfig};

async fn start(config: ServerConfig) -> (Server, String) {
    init_tracing();
    let server = Server::builder()
        .with_config(config)
        .with_services(services())
        .build()
        .unwrap();
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    (server, format!("ws://{}", addr))
}

#[tokio::test]
async fn test_call_over_websocket() {
    let (server, url) = start(ServerConfig::default()).await;
    let client = Connection::open(&url, client_config("ws-client")).await.unwrap();

    let greeting: String = client.call("Echo.say", vec![json!("hi")]).await.unwrap();
    assert_eq!(greeting, "hi");

    let session = server.session("ws-client").unwrap();
    assert!(session.remote().remote_addr.is_some());
    assert_eq!(session.client_name(), Some("tests"));

    client.close();
    server.close();
}

#[tokio::test]
async fn test_events_over_websocket() {
    let (server, url) = start(ServerConfig::default()).await;
    let listener = Connection::open(&url, client_config("listener")).await.unwrap();
    let emitter = Connection::open(&url, client_config("emitter")).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    listener
        .add_event_listener("Notify", json!({"room": "A"}), move |payload| {
            let tx = tx.clone();
            async move {
                tx.send(payload)?;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let targeted = emitter
        .emit("Notify", |filter| filter["room"] == "A", json!("over the wire"))
        .await
        .unwrap();
    assert_eq!(targeted, 1);
    assert_eq!(
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap(),
        Some(json!("over the wire"))
    );

    server.close();
}

#[tokio::test]
async fn test_heartbeat_keeps_responsive_client() {
    let config = ServerConfig::default().with_heartbeat_interval(Duration::from_millis(100));
    let (server, url) = start(config).await;
    let client = Connection::open(&url, client_config("steady")).await.unwrap();

    // Several sweeps; the client answers every ping
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.session_count(), 1);
    assert_eq!(client.request("Echo.say", vec![json!(7)]).await.unwrap(), json!(7));
    server.close();
}

#[tokio::test]
async fn test_reconnect_after_server_drop() {
    let (server, url) = start(ServerConfig::default()).await;
    let client = Connection::open(&url, client_config("phoenix")).await.unwrap();
    let mut state = client.watch_state();

    assert!(server.disconnect("phoenix"));
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(client.request("Echo.say", vec![json!("back")]).await.unwrap(), json!("back"));
    client.close();
    server.close();
}
