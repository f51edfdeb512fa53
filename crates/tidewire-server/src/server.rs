//! Server instance: accept loops, registries and server-initiated pushes

use crate::auth::{AllowAll, AuthProvider};
use crate::dispatcher::Dispatcher;
use crate::heartbeat::run_heartbeat;
use crate::listeners::ListenerRegistry;
use crate::registry::SessionRegistry;
use crate::service::{HandlerResolver, ServiceTable};
use crate::session::{self, SessionHandle};
use crate::{Result, ServerConfig};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tidewire_proto::{Broadcast, Message};
use tidewire_transport::{Acceptor, Transport, TransportError, WsListener};
use tokio::net::ToSocketAddrs;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) auth: Arc<dyn AuthProvider>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    config: ServerConfig,
    resolver: Option<Arc<dyn HandlerResolver>>,
    auth: Arc<dyn AuthProvider>,
}

impl ServerBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            resolver: None,
            auth: Arc::new(AllowAll),
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve the methods of a service table
    pub fn with_services(self, services: ServiceTable) -> Self {
        self.with_resolver(Arc::new(services))
    }

    /// Resolve methods through a custom resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn HandlerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validate handshakes with an auth provider
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Build the server and start its heartbeat
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Server> {
        self.config.protocol.validate()?;

        let resolver = self.resolver.unwrap_or_else(|| Arc::new(ServiceTable::default()));
        let sessions = Arc::new(SessionRegistry::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let dispatcher = Dispatcher::new(
            resolver,
            sessions.clone(),
            listeners.clone(),
            self.config.expose_error_details,
        );

        let shutdown = CancellationToken::new();
        let heartbeat = tokio::spawn(run_heartbeat(
            sessions.clone(),
            self.config.heartbeat_interval,
            shutdown.clone(),
        ));

        Ok(Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                sessions,
                listeners,
                dispatcher,
                auth: self.auth,
                shutdown,
                tasks: Mutex::new(vec![heartbeat.abort_handle()]),
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running server; cheap to clone
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Start building a server
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Run a session on an already accepted transport
    pub fn accept(&self, transport: Transport) -> JoinHandle<()> {
        debug!("Accepted transport from {}", transport.info());
        tokio::spawn(session::run(self.inner.clone(), transport))
    }

    /// Accept transports from an acceptor until it closes or the server shuts down
    pub fn serve<A>(&self, mut acceptor: A) -> JoinHandle<()>
    where
        A: Acceptor + 'static,
    {
        let server = self.clone();
        let task = tokio::spawn(async move {
            let shutdown = server.inner.shutdown.clone();
            loop {
                let accepted = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = acceptor.accept() => accepted,
                };

                match accepted {
                    Ok(transport) => {
                        server.accept(transport);
                    }
                    Err(TransportError::Closed) => {
                        debug!("Acceptor closed");
                        break;
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }
        });
        self.inner.tasks.lock().push(task.abort_handle());
        task
    }

    /// Listen for WebSocket connections, returning the bound address
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = WsListener::bind(addr).await?;
        let local_addr = listener.local_addr();
        self.serve(listener);
        info!("Server listening on ws://{}", local_addr);
        Ok(local_addr)
    }

    /// Push `payload` to every listener of `event_kind` whose filter matches
    pub fn emit<P>(&self, event_kind: &str, predicate: P, payload: &Value) -> usize
    where
        P: Fn(&Value) -> bool,
    {
        let keys: Vec<_> = self
            .inner
            .listeners
            .query(event_kind)
            .into_iter()
            .filter(|info| predicate(&info.filter))
            .map(|info| info.key)
            .collect();
        self.inner.listeners.dispatch(&self.inner.sessions, &keys, payload)
    }

    /// Tell clients that files changed, returning how many sessions were notified
    pub fn broadcast_reload(&self, client_name: Option<&str>, changed_files: Vec<String>) -> usize {
        let message = Message::Broadcast(Broadcast::Reload {
            client_name: client_name.map(str::to_string),
            changed_files,
        });

        let notified = self
            .inner
            .sessions
            .all()
            .iter()
            .filter(|session| session.push(&message))
            .count();
        info!("Broadcast reload to {} sessions", notified);
        notified
    }

    /// Live session of an identity
    pub fn session(&self, identity: &str) -> Option<SessionHandle> {
        self.inner.sessions.get(identity)
    }

    /// Snapshot of all live sessions
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.sessions.all()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of listener registrations across all sessions
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Terminate the session of an identity, `false` if none is live
    pub fn disconnect(&self, identity: &str) -> bool {
        match self.inner.sessions.get(identity) {
            Some(session) => {
                info!("Disconnecting {}", identity);
                session.terminate();
                true
            }
            None => false,
        }
    }

    /// Stop accepting, stop the heartbeat and terminate every session
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let sessions = self.inner.sessions.all();
        for session in &sessions {
            session.terminate();
        }
        info!("Server closed, terminated {} sessions", sessions.len());
    }

    /// Whether [`Server::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
