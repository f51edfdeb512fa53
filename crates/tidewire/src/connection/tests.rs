//! Unit tests for the client connection against a scripted peer

use super::*;
use crate::router::TransferProgress;
use serde_json::json;
use std::time::Duration;
use tidewire_proto::{ErrorBody, ErrorCode, Progress, ProtocolConfig, Response};
use tidewire_transport::memory::{self, MemoryConnector, MemoryListener};
use tidewire_transport::{Acceptor, Transport};

/// Server side of one memory link, driven by hand
struct Peer {
    transport: Transport,
    codec: MessageCodec,
}

impl Peer {
    async fn accept(listener: &mut MemoryListener) -> Self {
        let transport = listener.accept().await.unwrap();
        Self {
            transport,
            codec: MessageCodec::without_sweeper(ProtocolConfig::default()),
        }
    }

    async fn handshake(listener: &mut MemoryListener) -> (Self, IdentityReply) {
        let mut peer = Self::accept(listener).await;
        peer.send(&Message::IdentityRequest).await;
        let reply = match peer.recv().await {
            Some(Message::IdentityReply(reply)) => reply,
            other => panic!("Expected identity reply, got {:?}", other),
        };
        peer.send(&Message::ConnectedAck).await;
        (peer, reply)
    }

    async fn send(&mut self, message: &Message) {
        let id = message.request_id().unwrap_or_else(Uuid::new_v4);
        for frame in self.codec.encode(id, message).unwrap() {
            self.transport.send(WireMessage::Binary(frame.to_bytes())).await.unwrap();
        }
    }

    async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.transport.next_message().await? {
                Ok(WireMessage::Binary(data)) => {
                    if let Decoded::Complete { message, .. } = self.codec.decode(data).unwrap() {
                        return Some(message);
                    }
                }
                Ok(WireMessage::Close) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Some(Message::Request(request)) => request,
            other => panic!("Expected request, got {:?}", other),
        }
    }
}

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_identity("client-1")
        .with_client_name("tests")
        .with_reconnect(false)
}

async fn connect(config: ClientConfig) -> (Connection, Peer, MemoryListener, MemoryConnector) {
    let (connector, mut listener) = memory::listener();
    let client = tokio::spawn(Connection::connect(Arc::new(connector.clone()), config));
    let (peer, _) = Peer::handshake(&mut listener).await;
    let connection = client.await.unwrap().unwrap();
    (connection, peer, listener, connector)
}

#[tokio::test]
async fn test_handshake_reports_identity() {
    let (connector, mut listener) = memory::listener();
    let client = tokio::spawn(Connection::connect(
        Arc::new(connector),
        config().with_credential("secret"),
    ));

    let (_peer, reply) = Peer::handshake(&mut listener).await;
    assert_eq!(reply.identity, "client-1");
    assert_eq!(reply.client_name.as_deref(), Some("tests"));
    assert_eq!(reply.credential.as_deref(), Some("secret"));

    let connection = client.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_handshake_rejected() {
    let (connector, mut listener) = memory::listener();
    let client = tokio::spawn(Connection::connect(Arc::new(connector), config()));

    let mut peer = Peer::accept(&mut listener).await;
    peer.send(&Message::IdentityRequest).await;
    peer.recv().await;
    peer.send(&Message::HandshakeRejected {
        reason: "bad token".to_string(),
    })
    .await;

    match client.await.unwrap() {
        Err(ClientError::Handshake(reason)) => assert_eq!(reason, "bad token"),
        other => panic!("Expected handshake error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let (connector, mut listener) = memory::listener();
    let client = tokio::spawn(Connection::connect(
        Arc::new(connector),
        config().with_handshake_timeout(Duration::from_secs(5)),
    ));

    // Accept but never ask for the identity
    let _peer = Peer::accept(&mut listener).await;
    match client.await.unwrap() {
        Err(ClientError::Timeout { duration }) => assert_eq!(duration, Duration::from_secs(5)),
        other => panic!("Expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_resolves_and_rejects() {
    let (connection, mut peer, _listener, _connector) = connect(config()).await;

    let caller = connection.clone();
    let ok = tokio::spawn(async move { caller.request("Echo.say", vec![json!("hi")]).await });
    let request = peer.recv_request().await;
    assert_eq!(request.command, "Echo.say");
    assert_eq!(request.client_name.as_deref(), Some("tests"));
    peer.send(&Message::Response(Response::success(request.id, json!("hi")))).await;
    assert_eq!(ok.await.unwrap().unwrap(), json!("hi"));

    let caller = connection.clone();
    let failed = tokio::spawn(async move { caller.request("Echo.fail", vec![]).await });
    let request = peer.recv_request().await;
    let body = ErrorBody::new(ErrorCode::InternalError, "boom").with_stack("trace");
    peer.send(&Message::Response(Response::error(request.id, body))).await;

    let error = failed.await.unwrap().unwrap_err();
    let remote = error.remote().unwrap();
    assert_eq!(remote.message, "boom");
    assert_eq!(remote.stack.as_deref(), Some("trace"));
    assert_eq!(connection.pending_requests(), 0);
}

#[tokio::test]
async fn test_responses_out_of_order() {
    let (connection, mut peer, _listener, _connector) = connect(config()).await;

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call::<u32>("Math.slow", vec![]).await }
    });
    let slow = peer.recv_request().await;
    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call::<u32>("Math.fast", vec![]).await }
    });
    let fast = peer.recv_request().await;

    peer.send(&Message::Response(Response::success(fast.id, json!(2)))).await;
    peer.send(&Message::Response(Response::success(slow.id, json!(1)))).await;

    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(second.await.unwrap().unwrap(), 2);
}

#[tokio::test]
async fn test_link_loss_rejects_pending() {
    let (connection, mut peer, _listener, _connector) = connect(config()).await;
    let mut events = connection.subscribe();

    let caller = connection.clone();
    let pending = tokio::spawn(async move { caller.request("Echo.never", vec![]).await });
    peer.recv_request().await;
    drop(peer);

    let error = pending.await.unwrap().unwrap_err();
    assert!(error.is_transport(), "unexpected {:?}", error);
    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::StateChanged(ConnectionState::Disconnected)
    );
    assert_eq!(connection.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_calls_wait_for_link_then_time_out() {
    let (connection, peer, _listener, _connector) =
        connect(config().with_open_timeout(Duration::from_secs(3))).await;
    drop(peer);

    let mut state = connection.watch_state();
    state
        .wait_for(|state| *state == ConnectionState::Disconnected)
        .await
        .unwrap();

    match connection.request("Echo.say", vec![]).await {
        Err(ClientError::Timeout { duration }) => assert_eq!(duration, Duration::from_secs(3)),
        other => panic!("Expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_rejects_pending() {
    let (connection, mut peer, _listener, _connector) = connect(config()).await;

    let caller = connection.clone();
    let pending = tokio::spawn(async move { caller.request("Echo.never", vec![]).await });
    peer.recv_request().await;

    connection.close();
    assert!(matches!(pending.await.unwrap(), Err(ClientError::Closed)));
    assert!(matches!(connection.request("Echo.say", vec![]).await, Err(ClientError::Closed)));
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_dropping_last_handle_closes_link() {
    let (connection, mut peer, _listener, _connector) =
        connect(config().with_reconnect(true)).await;
    let mut state = connection.watch_state();

    let clone = connection.clone();
    drop(connection);
    assert!(!clone.is_closed());
    assert_eq!(clone.state(), ConnectionState::Connected);

    drop(clone);
    assert!(tokio::time::timeout(Duration::from_secs(5), peer.recv())
        .await
        .unwrap()
        .is_none());
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_progress_both_directions() {
    let protocol = ProtocolConfig::default()
        .with_split_threshold(1024)
        .with_chunk_size(256);
    let (connection, mut peer, _listener, _connector) =
        connect(config().with_protocol(protocol.clone())).await;
    peer.codec = MessageCodec::without_sweeper(protocol);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let on_progress: ProgressFn =
        Arc::new(move |progress: TransferProgress| sink.lock().push(progress.direction));

    let caller = connection.clone();
    let call = tokio::spawn(async move {
        caller
            .send_request("Blob.get", vec![], Some(on_progress))
            .await
    });
    let request = peer.recv_request().await;

    peer.send(&Message::Progress(Progress {
        correlation_id: request.id,
        received: 10,
        total: 20,
    }))
    .await;
    let blob = "y".repeat(3000);
    peer.send(&Message::Response(Response::success(request.id, json!(blob)))).await;

    assert_eq!(call.await.unwrap().unwrap(), json!(blob));
    let seen = seen.lock();
    assert_eq!(seen.first(), Some(&Direction::Upload));
    assert!(seen.len() > 1);
    assert!(seen[1..].iter().all(|direction| *direction == Direction::Download));
}

#[tokio::test]
async fn test_event_callbacks_isolated() {
    let (connection, mut peer, _listener, _connector) = connect(config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let caller = connection.clone();
    let failing = tokio::spawn(async move {
        caller
            .add_event_listener("Notify", json!({"room": "A"}), |_payload| async {
                Err::<(), _>(anyhow::anyhow!("listener exploded"))
            })
            .await
    });
    let request = peer.recv_request().await;
    assert_eq!(request.params, vec![json!("Notify"), json!({"room": "A"})]);
    peer.send(&Message::Response(Response::success(request.id, json!("k1")))).await;
    failing.await.unwrap().unwrap();

    let caller = connection.clone();
    let working = tokio::spawn(async move {
        caller
            .add_event_listener("Notify", json!({"room": "B"}), move |payload| {
                let tx = tx.clone();
                async move {
                    tx.send(payload)?;
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await
    });
    let request = peer.recv_request().await;
    peer.send(&Message::Response(Response::success(request.id, json!("k2")))).await;
    let key = working.await.unwrap().unwrap();

    for server_key in ["k1", "k2", "unknown"] {
        peer.send(&Message::Event(Event {
            key: server_key.into(),
            payload: json!(server_key),
        }))
        .await;
    }
    assert_eq!(rx.recv().await, Some(json!("k2")));
    assert_eq!(connection.listener_count(), 2);

    let caller = connection.clone();
    let removal = tokio::spawn(async move { caller.remove_event_listener(&key).await });
    let request = peer.recv_request().await;
    assert_eq!(request.params, vec![json!("k2")]);
    peer.send(&Message::Response(Response::success(request.id, Value::Null))).await;
    removal.await.unwrap().unwrap();
    assert_eq!(connection.listener_count(), 1);

    // Unknown keys never reach the server
    connection.remove_event_listener(&ListenerKey::generate()).await.unwrap();
}

#[tokio::test]
async fn test_reload_broadcast_filtered_by_name() {
    let (connection, mut peer, _listener, _connector) = connect(config()).await;
    let mut events = connection.subscribe();

    for name in [Some("other"), Some("tests"), None] {
        peer.send(&Message::Broadcast(Broadcast::Reload {
            client_name: name.map(str::to_string),
            changed_files: vec![format!("{:?}.js", name)],
        }))
        .await;
    }

    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Reload {
            changed_files: vec!["Some(\"tests\").js".to_string()]
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Reload {
            changed_files: vec!["None.js".to_string()]
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_listeners() {
    let config = config()
        .with_reconnect(true)
        .with_reconnect_delay(Duration::from_secs(3));
    let (connection, mut peer, mut listener, _connector) = connect(config).await;

    let caller = connection.clone();
    let add = tokio::spawn(async move {
        caller
            .add_event_listener("Notify", json!({"room": "A"}), |_payload| async {
                Ok::<(), anyhow::Error>(())
            })
            .await
    });
    let request = peer.recv_request().await;
    peer.send(&Message::Response(Response::success(request.id, json!("old-key")))).await;
    add.await.unwrap().unwrap();

    drop(peer);
    let started = tokio::time::Instant::now();
    let (mut peer, reply) = Peer::handshake(&mut listener).await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(reply.identity, "client-1");

    let replay = peer.recv_request().await;
    assert_eq!(replay.command, tidewire_proto::command::ADD_EVENT_LISTENER);
    assert_eq!(replay.params, vec![json!("Notify"), json!({"room": "A"})]);
    peer.send(&Message::Response(Response::success(replay.id, json!("new-key")))).await;

    let mut state = connection.watch_state();
    state
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();
    connection.close();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up() {
    let config = config()
        .with_reconnect(true)
        .with_reconnect_delay(Duration::from_secs(1))
        .with_max_reconnect_attempts(2);
    let (connection, peer, listener, _connector) = connect(config).await;

    // Nobody accepts anymore
    drop(listener);
    drop(peer);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    let supervisor = connection.inner.supervisor.lock().take().unwrap();
    assert!(supervisor.is_finished());
}
