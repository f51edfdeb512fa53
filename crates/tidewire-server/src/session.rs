//! Per-connection session state and lifecycle

use crate::auth::Principal;
use crate::server::ServerInner;
use crate::{Result, ServerError};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidewire_proto::{
    Decoded, ErrorBody, IdentityReply, Message, MessageCodec, Progress, ProtocolError, Request,
    Response,
};
use tidewire_transport::{
    ConnectionInfo, Transport, TransportError, WireMessage, WireSink, WireStream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timestamp format used when logging session lifetimes
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Shared handle to a live session
pub type SessionHandle = Arc<Session>;

/// Server-side record of one identified connection
pub struct Session {
    id: Uuid,
    principal: Principal,
    client_name: Option<String>,
    connected_at: DateTime<Local>,
    remote: ConnectionInfo,
    alive: AtomicBool,
    outbound: mpsc::Sender<WireMessage>,
    codec: Arc<MessageCodec>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        principal: Principal,
        client_name: Option<String>,
        remote: ConnectionInfo,
        outbound: mpsc::Sender<WireMessage>,
        codec: Arc<MessageCodec>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            client_name,
            connected_at: Local::now(),
            remote,
            alive: AtomicBool::new(true),
            outbound,
            codec,
            cancel: CancellationToken::new(),
        }
    }

    /// Unique id of this session; a reconnecting identity gets a new one
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identity the client reported
    pub fn identity(&self) -> &str {
        &self.principal.identity
    }

    /// Principal yielded by the auth provider
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Name of the client application
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// When the handshake completed
    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    /// Peer information of the underlying transport
    pub fn remote(&self) -> &ConnectionInfo {
        &self.remote
    }

    /// Whether a pong arrived since the last heartbeat ping
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Record a pong
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Clear the liveness flag, returning its previous value
    pub(crate) fn begin_heartbeat(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// Whether a push would be queued right now
    pub fn is_writable(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed() && self.outbound.capacity() > 0
    }

    /// Send a message, split into frames when it is large
    pub async fn send(&self, correlation_id: Uuid, message: &Message) -> Result<()> {
        let frames = self.codec.encode(correlation_id, message)?;
        for frame in frames {
            self.outbound
                .send(WireMessage::Binary(frame.to_bytes()))
                .await
                .map_err(|_| ServerError::SessionClosed)?;
        }
        Ok(())
    }

    /// Queue a message as a single frame without waiting, `false` if it was dropped
    pub fn push(&self, message: &Message) -> bool {
        if !self.is_writable() {
            return false;
        }

        match self.codec.encode_single(Uuid::new_v4(), message) {
            Ok(frame) => self.outbound.try_send(WireMessage::Binary(frame.to_bytes())).is_ok(),
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", message.kind(), self.identity(), e);
                false
            }
        }
    }

    pub(crate) fn ping(&self) -> bool {
        self.outbound.try_send(WireMessage::Ping(Bytes::new())).is_ok()
    }

    /// Close the connection; the session task tears itself down
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Whether [`Session::terminate`] was called or the link failed
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.principal.identity)
            .field("client_name", &self.client_name)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Drive one accepted transport from handshake to teardown
pub(crate) async fn run(server: Arc<ServerInner>, transport: Transport) {
    let (mut sink, mut stream, info) = transport.split();
    let codec = Arc::new(MessageCodec::new(server.config.protocol.clone()));

    let accepted = handshake(&server, &codec, sink.as_mut(), stream.as_mut()).await;
    let (principal, client_name) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Handshake with {} failed: {}", info, e);
            if let Err(e) = sink.close().await {
                debug!("Close after failed handshake: {}", e);
            }
            codec.dispose();
            return;
        }
    };

    let (tx, rx) = mpsc::channel(server.config.outbound_buffer);
    let session = Arc::new(Session::new(principal, client_name, info, tx, codec.clone()));

    if let Some(previous) = server.sessions.insert(session.clone()) {
        info!(
            "Evicting previous session of {} (connected at {})",
            previous.identity(),
            previous.connected_at().format(TIMESTAMP_FORMAT)
        );
        previous.terminate();
    }

    if let Err(e) = send_single(&codec, sink.as_mut(), &Message::ConnectedAck).await {
        warn!("Failed to acknowledge {}: {}", session.identity(), e);
    } else {
        info!(
            "Client connected: {} from {} ({} sessions)",
            session.identity(),
            session.remote(),
            server.sessions.len()
        );

        let writer = tokio::spawn(write_loop(sink, rx, session.cancel.clone()));
        read_loop(&server, &session, stream.as_mut()).await;
        session.terminate();
        if let Err(e) = writer.await {
            debug!("Writer task of {} ended abnormally: {}", session.identity(), e);
        }
    }

    session.terminate();
    server.sessions.remove(&session);
    let purged = server.listeners.remove_session(session.id());
    codec.dispose();
    info!(
        "Client disconnected: {} (connected at {}, {} listeners dropped, {} sessions)",
        session.identity(),
        session.connected_at().format(TIMESTAMP_FORMAT),
        purged,
        server.sessions.len()
    );
}

async fn handshake(
    server: &ServerInner,
    codec: &MessageCodec,
    sink: &mut dyn WireSink,
    stream: &mut dyn WireStream,
) -> Result<(Principal, Option<String>)> {
    send_single(codec, sink, &Message::IdentityRequest).await?;

    let timeout = server.config.handshake_timeout;
    let reply = tokio::time::timeout(timeout, wait_for_identity(codec, sink, stream))
        .await
        .map_err(|_| ServerError::HandshakeTimeout(timeout))??;

    match server.auth.authenticate(&reply).await {
        Ok(principal) => Ok((principal, reply.client_name)),
        Err(e) => {
            let reason = match &e {
                ServerError::Auth(reason) => reason.clone(),
                other => other.to_string(),
            };
            send_single(codec, sink, &Message::HandshakeRejected { reason }).await?;
            Err(e)
        }
    }
}

async fn wait_for_identity(
    codec: &MessageCodec,
    sink: &mut dyn WireSink,
    stream: &mut dyn WireStream,
) -> Result<IdentityReply> {
    while let Some(message) = stream.next_message().await {
        match message? {
            WireMessage::Binary(data) => match codec.decode(data)? {
                Decoded::Complete {
                    message: Message::IdentityReply(reply),
                    ..
                } => return Ok(reply),
                Decoded::Complete { message, .. } => {
                    debug!("Ignoring {} before handshake", message.kind());
                }
                Decoded::Progress { .. } => {}
            },
            WireMessage::Ping(data) => sink.send(WireMessage::Pong(data)).await?,
            WireMessage::Pong(_) => {}
            WireMessage::Close => break,
        }
    }
    Err(ServerError::Transport(TransportError::Closed))
}

async fn send_single(
    codec: &MessageCodec,
    sink: &mut dyn WireSink,
    message: &Message,
) -> Result<()> {
    let frame = codec.encode_single(Uuid::new_v4(), message)?;
    sink.send(WireMessage::Binary(frame.to_bytes())).await?;
    Ok(())
}

async fn write_loop(
    mut sink: Box<dyn WireSink>,
    mut rx: mpsc::Receiver<WireMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        debug!("Session write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    if let Err(e) = sink.close().await {
        debug!("Session close failed: {}", e);
    }
}

async fn read_loop(
    server: &Arc<ServerInner>,
    session: &SessionHandle,
    stream: &mut dyn WireStream,
) {
    loop {
        let message = tokio::select! {
            _ = session.cancel.cancelled() => break,
            message = stream.next_message() => message,
        };

        match message {
            Some(Ok(WireMessage::Binary(data))) => handle_frame(server, session, data),
            Some(Ok(WireMessage::Ping(data))) => {
                // Queue full means the writer is stalled; the peer will retry
                let _ = session.outbound.try_send(WireMessage::Pong(data));
            }
            Some(Ok(WireMessage::Pong(_))) => session.mark_alive(),
            Some(Ok(WireMessage::Close)) | None => break,
            Some(Err(e)) => {
                warn!("Read error on session {}: {}", session.identity(), e);
                break;
            }
        }
    }
}

fn handle_frame(server: &Arc<ServerInner>, session: &SessionHandle, data: Bytes) {
    match session.codec.decode(data) {
        Ok(Decoded::Complete {
            message: Message::Request(request),
            ..
        }) => {
            debug!(
                "Request {} '{}' from {}",
                request.id,
                request.command,
                session.identity()
            );
            let server = server.clone();
            let session = session.clone();
            tokio::spawn(async move {
                respond(&server, &session, request).await;
            });
        }
        Ok(Decoded::Complete { message, .. }) => {
            debug!("Ignoring {} from {}", message.kind(), session.identity());
        }
        Ok(Decoded::Progress {
            correlation_id,
            received,
            total,
        }) => {
            debug!(
                "Receiving split request {} from {}: {}/{} bytes",
                correlation_id,
                session.identity(),
                received,
                total
            );
            session.push(&Message::Progress(Progress {
                correlation_id,
                received,
                total,
            }));
        }
        Err(e) => {
            warn!("Rejected frame from {}: {}", session.identity(), e);
            if let Some(correlation_id) = e.correlation_id() {
                let response = Response::error(correlation_id, ErrorBody::from(e));
                let session = session.clone();
                tokio::spawn(async move {
                    let message = Message::response(response);
                    if let Err(e) = session.send(correlation_id, &message).await {
                        debug!("Failed to report rejected frame: {}", e);
                    }
                });
            }
        }
    }
}

async fn respond(server: &ServerInner, session: &Session, request: Request) {
    let request_id = request.id;
    let response = server.dispatcher.dispatch(session, request).await;

    match session.send(request_id, &Message::response(response)).await {
        Ok(()) => debug!("Sent response {} to {}", request_id, session.identity()),
        Err(ServerError::Protocol(e @ ProtocolError::SizeLimitExceeded { .. })) => {
            warn!("Response {} to {} is too large: {}", request_id, session.identity(), e);
            let fallback = Response::error(request_id, ErrorBody::from(e));
            if let Err(e) = session.send(request_id, &Message::response(fallback)).await {
                debug!("Failed to send size error to {}: {}", session.identity(), e);
            }
        }
        Err(e) => debug!("Dropped response {} to {}: {}", request_id, session.identity(), e),
    }
}
