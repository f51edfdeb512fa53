//! Client connection: handshake, request correlation, reconnect and listeners

use crate::events::{EventCallback, ListenerTable};
use crate::router::{Direction, ProgressFn, Router};
use crate::{ClientConfig, ClientError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidewire_proto::{
    Broadcast, ControlRequest, Decoded, Event, IdentityReply, ListenerInfo, ListenerKey, Message,
    MessageCodec,
    Request,
};
use tidewire_transport::{Connector, TransportError, WireMessage, WireSink, WireStream, WsConnector};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OUTBOUND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 64;

/// Link state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link; calls wait for a reconnect
    Disconnected,
    /// Opening a link or waiting for the handshake
    Connecting,
    /// Handshake complete
    Connected,
}

/// Notifications delivered to [`Connection::subscribe`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The link state changed
    StateChanged(ConnectionState),
    /// The server reported changed files for this client
    Reload {
        /// Changed file paths
        changed_files: Vec<String>,
    },
}

/// One established link
#[derive(Clone)]
struct Link {
    id: u64,
    outbound: mpsc::Sender<WireMessage>,
    codec: Arc<MessageCodec>,
    cancel: CancellationToken,
}

impl Link {
    async fn send(&self, correlation_id: Uuid, message: &Message) -> Result<()> {
        let frames = self.codec.encode(correlation_id, message)?;
        for frame in frames {
            self.outbound
                .send(WireMessage::Binary(frame.to_bytes()))
                .await
                .map_err(|_| ClientError::Transport(TransportError::Closed))?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    router: Router,
    listeners: ListenerTable,
    lost: Notify,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            // No subscribers is fine
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
    }

    /// Current link, waiting up to the open timeout while (re)connecting
    async fn wait_for_link(&self) -> Result<Link> {
        let mut state = self.state.subscribe();
        let wait = async {
            loop {
                if self.shutdown.is_cancelled() {
                    return Err(ClientError::Closed);
                }
                let current = self.link.lock().clone();
                if let Some(link) = current {
                    return Ok(link);
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(ClientError::Closed),
                    changed = state.changed() => {
                        if changed.is_err() {
                            return Err(ClientError::Closed);
                        }
                    }
                }
            }
        };

        let timeout = self.config.open_timeout;
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout { duration: timeout })?
    }

    async fn send(&self, request: Request, on_progress: Option<ProgressFn>) -> Result<Value> {
        let link = self.wait_for_link().await?;
        let request = request.with_client_name(self.config.client_name.clone());
        let request_id = request.id;
        debug!("Sending request {} '{}'", request_id, request.command);

        let reply = self.router.register(request_id, on_progress);
        if link.is_closed() {
            self.router.remove(request_id);
            return Err(ClientError::Transport(TransportError::Closed));
        }
        if let Err(e) = link.send(request_id, &Message::Request(request)).await {
            self.router.remove(request_id);
            return Err(e);
        }

        let outcome = match self.config.request_timeout {
            Some(duration) => match tokio::time::timeout(duration, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.router.remove(request_id);
                    return Err(ClientError::Timeout { duration });
                }
            },
            None => reply.await,
        };
        outcome.unwrap_or(Err(ClientError::Closed))
    }

    async fn control(&self, control: ControlRequest) -> Result<Value> {
        self.send(control.into_request(), None).await
    }

    fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        if let Some(link) = self.link.lock().take() {
            link.cancel.cancel();
        }

        let rejected = self.router.reject_all(|| ClientError::Closed);
        self.set_state(ConnectionState::Disconnected);
        info!(
            "Closed connection to {}, rejected {} pending requests",
            self.connector.target(),
            rejected
        );
    }
}

/// Closes the connection once the last user handle is dropped
///
/// Background tasks hold `Inner` but never this guard.
struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A client connection to a Tidewire server; cheap to clone
///
/// Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    _guard: Arc<CloseOnDrop>,
}

impl Connection {
    /// Open a link through `connector` and complete the handshake
    ///
    /// When reconnect is enabled a supervisor task re-opens the link after
    /// it is lost; [`Connection::close`] stops it.
    pub async fn connect(connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Self> {
        config.protocol.validate()?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let inner = Arc::new(Inner {
            config,
            connector,
            link: Mutex::new(None),
            next_link_id: AtomicU64::new(0),
            state,
            events,
            router: Router::new(),
            listeners: ListenerTable::new(),
            lost: Notify::new(),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        inner.set_state(ConnectionState::Connecting);
        if let Err(e) = establish(&inner).await {
            inner.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        if inner.config.reconnect {
            let task = tokio::spawn(supervise(inner.clone()));
            *inner.supervisor.lock() = Some(task);
        }

        Ok(Self {
            _guard: Arc::new(CloseOnDrop(inner.clone())),
            inner,
        })
    }

    /// Connect to a WebSocket URL such as `ws://127.0.0.1:7600`
    pub async fn open(url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        Self::connect(Arc::new(WsConnector::new(url)), config).await
    }

    /// Identity reported to the server
    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current link state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the link state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to state changes and reload broadcasts
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Call a command, reporting transfer progress of split messages
    pub async fn send_request(
        &self,
        command: impl Into<String>,
        params: Vec<Value>,
        on_progress: Option<ProgressFn>,
    ) -> Result<Value> {
        self.inner.send(Request::new(command, params), on_progress).await
    }

    /// Call a command
    pub async fn request(&self, command: impl Into<String>, params: Vec<Value>) -> Result<Value> {
        self.send_request(command, params, None).await
    }

    /// Call a command and deserialize its result
    pub async fn call<R>(&self, command: impl Into<String>, params: Vec<Value>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let body = self.request(command, params).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Register a listener; `callback` runs for each matching event
    ///
    /// The returned key stays valid across reconnects. Callback errors are
    /// logged and do not affect other events.
    pub async fn add_event_listener<F, Fut>(
        &self,
        event_kind: impl Into<String>,
        filter: Value,
        callback: F,
    ) -> Result<ListenerKey>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event_kind = event_kind.into();
        let callback: EventCallback = Arc::new(move |payload| callback(payload).boxed());

        let server_key = server_key(
            self.inner
                .control(ControlRequest::AddEventListener {
                    event_kind: event_kind.clone(),
                    filter: filter.clone(),
                })
                .await?,
        )?;

        let local_key = ListenerKey::generate();
        debug!("Listening for {} as {} (server key {})", event_kind, local_key, server_key);
        self.inner
            .listeners
            .insert(local_key.clone(), event_kind, filter, callback, server_key);
        Ok(local_key)
    }

    /// Drop a listener; unknown keys are ignored
    pub async fn remove_event_listener(&self, key: &ListenerKey) -> Result<()> {
        let Some(server_key) = self.inner.listeners.remove(key) else {
            return Ok(());
        };

        if let Some(server_key) = server_key {
            self.inner
                .control(ControlRequest::RemoveEventListener { key: server_key })
                .await?;
        }
        Ok(())
    }

    /// Registrations of all clients for an event kind
    pub async fn listener_infos(&self, event_kind: impl Into<String>) -> Result<Vec<ListenerInfo>> {
        let body = self
            .inner
            .control(ControlRequest::GetEventListenerInfos {
                event_kind: event_kind.into(),
            })
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Push `payload` to every listener of `event_kind` whose filter matches
    ///
    /// Returns how many listeners were targeted.
    pub async fn emit<P>(
        &self,
        event_kind: impl Into<String>,
        predicate: P,
        payload: Value,
    ) -> Result<usize>
    where
        P: Fn(&Value) -> bool,
    {
        let keys: Vec<ListenerKey> = self
            .listener_infos(event_kind)
            .await?
            .into_iter()
            .filter(|info| predicate(&info.filter))
            .map(|info| info.key)
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }

        let targeted = keys.len();
        self.inner.control(ControlRequest::EmitEvent { keys, payload }).await?;
        Ok(targeted)
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.router.len()
    }

    /// Number of listeners added through this connection
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Close the link, stop reconnecting and fail pending requests
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`Connection::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.inner.connector.target())
            .field("identity", &self.inner.config.identity)
            .field("state", &self.state())
            .finish()
    }
}

fn server_key(body: Value) -> Result<ListenerKey> {
    match body {
        Value::String(key) => Ok(ListenerKey(key)),
        other => Err(ClientError::Serialization(format!(
            "expected a listener key, got {}",
            other
        ))),
    }
}

/// Open a transport, handshake and install the link
async fn establish(inner: &Arc<Inner>) -> Result<()> {
    let config = &inner.config;
    let transport = tokio::time::timeout(config.open_timeout, inner.connector.connect())
        .await
        .map_err(|_| ClientError::Timeout {
            duration: config.open_timeout,
        })??;

    let (mut sink, mut stream, info) = transport.split();
    let codec = Arc::new(MessageCodec::new(config.protocol.clone()));

    let outcome = match tokio::time::timeout(
        config.handshake_timeout,
        handshake(config, &codec, sink.as_mut(), stream.as_mut()),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(ClientError::Timeout {
            duration: config.handshake_timeout,
        }),
    };

    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let link = Link {
        id: inner.next_link_id.fetch_add(1, Ordering::SeqCst),
        outbound: tx,
        codec: codec.clone(),
        cancel: CancellationToken::new(),
    };

    let outcome = outcome.and_then(|()| {
        let mut current = inner.link.lock();
        if inner.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        *current = Some(link.clone());
        Ok(())
    });

    if let Err(e) = outcome {
        codec.dispose();
        if let Err(close_err) = sink.close().await {
            debug!("Close after failed handshake: {}", close_err);
        }
        return Err(e);
    }

    tokio::spawn(write_loop(sink, rx, link.cancel.clone()));
    tokio::spawn(read_loop(inner.clone(), link, stream));

    info!(
        "Connected to {} as {} ({})",
        inner.connector.target(),
        config.identity,
        info
    );
    inner.set_state(ConnectionState::Connected);
    Ok(())
}

async fn handshake(
    config: &ClientConfig,
    codec: &MessageCodec,
    sink: &mut dyn WireSink,
    stream: &mut dyn WireStream,
) -> Result<()> {
    while let Some(message) = stream.next_message().await {
        match message? {
            WireMessage::Binary(data) => match codec.decode(data)? {
                Decoded::Complete {
                    message: Message::IdentityRequest,
                    ..
                } => {
                    let reply = Message::IdentityReply(IdentityReply {
                        identity: config.identity.clone(),
                        client_name: config.client_name.clone(),
                        credential: config.credential.clone(),
                    });
                    let frame = codec.encode_single(Uuid::new_v4(), &reply)?;
                    sink.send(WireMessage::Binary(frame.to_bytes())).await?;
                }
                Decoded::Complete {
                    message: Message::ConnectedAck,
                    ..
                } => return Ok(()),
                Decoded::Complete {
                    message: Message::HandshakeRejected { reason },
                    ..
                } => return Err(ClientError::Handshake(reason)),
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
    Err(ClientError::Transport(TransportError::Closed))
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
                        debug!("Client write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    if let Err(e) = sink.close().await {
        debug!("Client close failed: {}", e);
    }
}

async fn read_loop(inner: Arc<Inner>, link: Link, mut stream: Box<dyn WireStream>) {
    loop {
        let message = tokio::select! {
            _ = link.cancel.cancelled() => break,
            message = stream.next_message() => message,
        };

        match message {
            Some(Ok(WireMessage::Binary(data))) => match link.codec.decode(data) {
                Ok(Decoded::Complete { message, .. }) => handle_message(&inner, message),
                Ok(Decoded::Progress {
                    correlation_id,
                    received,
                    total,
                }) => {
                    inner
                        .router
                        .progress(correlation_id, Direction::Download, received, total);
                }
                Err(e) => {
                    warn!("Rejected frame from {}: {}", inner.connector.target(), e);
                    if let Some(correlation_id) = e.correlation_id() {
                        inner.router.fail(correlation_id, ClientError::Protocol(e));
                    }
                }
            },
            Some(Ok(WireMessage::Ping(data))) => {
                // Queue full means the writer is stalled; the server will retry
                let _ = link.outbound.try_send(WireMessage::Pong(data));
            }
            Some(Ok(WireMessage::Pong(_))) => {}
            Some(Ok(WireMessage::Close)) | None => {
                debug!("Server closed the link");
                break;
            }
            Some(Err(e)) => {
                warn!("Read error from {}: {}", inner.connector.target(), e);
                break;
            }
        }
    }

    link_lost(&inner, &link);
}

fn handle_message(inner: &Inner, message: Message) {
    match message {
        Message::Response(response) => {
            inner.router.complete(response);
        }
        Message::Progress(progress) => {
            inner.router.progress(
                progress.correlation_id,
                Direction::Upload,
                progress.received,
                progress.total,
            );
        }
        Message::Event(event) => dispatch_event(inner, event),
        Message::Broadcast(Broadcast::Reload {
            client_name,
            changed_files,
        }) => {
            if client_name.is_none() || client_name == inner.config.client_name {
                info!("Server reported {} changed files", changed_files.len());
                let _ = inner.events.send(ConnectionEvent::Reload { changed_files });
            }
        }
        other => debug!("Ignoring {} from server", other.kind()),
    }
}

fn dispatch_event(inner: &Inner, event: Event) {
    let Some(callback) = inner.listeners.callback(&event.key) else {
        debug!("No listener for event key {}", event.key);
        return;
    };

    let Event { key, payload } = event;
    tokio::spawn(async move {
        if let Err(e) = callback(payload).await {
            error!("Listener {} failed: {:#}", key, e);
        }
    });
}

/// Tear down a link that stopped reading
fn link_lost(inner: &Inner, link: &Link) {
    link.cancel.cancel();
    link.codec.dispose();

    let was_current = {
        let mut current = inner.link.lock();
        if current.as_ref().map(|l| l.id) == Some(link.id) {
            current.take();
            true
        } else {
            false
        }
    };
    // Closed locally, close() already cleaned up
    if !was_current {
        return;
    }

    inner.listeners.unbind_all();
    let rejected = inner
        .router
        .reject_all(|| ClientError::Transport(TransportError::Closed));
    warn!(
        "Lost connection to {}, rejected {} pending requests",
        inner.connector.target(),
        rejected
    );
    inner.set_state(ConnectionState::Disconnected);
    inner.lost.notify_one();
}

/// Re-open the link each time it is lost until shutdown
async fn supervise(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.lost.notified() => {}
        }

        if !reconnect(&inner).await {
            break;
        }
    }
    debug!("Reconnect supervisor for {} stopped", inner.connector.target());
}

/// Retry with a fixed delay; `false` once retrying should stop
async fn reconnect(inner: &Arc<Inner>) -> bool {
    let config = &inner.config;
    let target = inner.connector.target();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tokio::select! {
            _ = inner.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }

        inner.set_state(ConnectionState::Connecting);
        info!("Reconnecting to {} (attempt {})", target, attempt);

        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => return false,
            outcome = establish(inner) => outcome,
        };

        match outcome {
            Ok(()) => {
                restore_listeners(inner).await;
                return true;
            }
            Err(e) => {
                warn!("Reconnect attempt {} to {} failed: {}", attempt, target, e);
                if inner.shutdown.is_cancelled() {
                    return false;
                }
                inner.set_state(ConnectionState::Disconnected);
                if config.max_reconnect_attempts > 0 && attempt >= config.max_reconnect_attempts {
                    error!("Giving up on {} after {} attempts", target, attempt);
                    return false;
                }
            }
        }
    }
}

/// Register every listener again on the new link
async fn restore_listeners(inner: &Inner) {
    let registrations = inner.listeners.registrations();
    if registrations.is_empty() {
        return;
    }

    let total = registrations.len();
    let mut restored = 0;
    for registration in registrations {
        let control = ControlRequest::AddEventListener {
            event_kind: registration.event_kind.clone(),
            filter: registration.filter,
        };

        match inner.control(control).await.and_then(server_key) {
            Ok(key) if inner.listeners.bind(&registration.local_key, key.clone()) => restored += 1,
            Ok(key) => {
                // Removed while re-registering
                if let Err(e) = inner.control(ControlRequest::RemoveEventListener { key }).await {
                    debug!("Failed to drop stale listener: {}", e);
                }
            }
            Err(e) => warn!(
                "Failed to restore listener {} for {}: {}",
                registration.local_key, registration.event_kind, e
            ),
        }
    }
    info!("Restored {}/{} listeners", restored, total);
}

#[cfg(test)]
mod tests;
