//! WebSocket transport over TCP

use crate::{
    Acceptor, ConnectionInfo, Connector, Transport, TransportError, WireMessage, WireSink,
    WireStream,
};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How long an incoming TCP connection may take to complete the upgrade
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> WireSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Binary(data) => Message::Binary(data),
            WireMessage::Ping(data) => Message::Ping(data),
            WireMessage::Pong(data) => Message::Pong(data),
            WireMessage::Close => Message::Close(None),
        };
        self.inner.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) => Ok(()),
            Err(e) => match TransportError::from(e) {
                TransportError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }
}

struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> WireStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return match TransportError::from(e) {
                        TransportError::Closed => None,
                        other => Some(Err(other)),
                    }
                }
            };

            let message = match message {
                Message::Binary(data) => WireMessage::Binary(data),
                Message::Ping(data) => WireMessage::Ping(data),
                Message::Pong(data) => WireMessage::Pong(data),
                Message::Close(_) => WireMessage::Close,
                Message::Text(_) => {
                    debug!("Ignoring text frame on binary transport");
                    continue;
                }
                Message::Frame(_) => continue,
            };
            return Some(Ok(message));
        }
    }
}

fn from_websocket<S>(ws: WebSocketStream<S>, info: ConnectionInfo) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Transport::new(Box::new(WsSink { inner: sink }), Box::new(WsStream { inner: stream }), info)
}

/// Complete the server side of the upgrade on an accepted TCP stream
pub async fn accept(stream: TcpStream) -> Result<Transport, TransportError> {
    let remote_addr = stream.peer_addr().ok();
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(from_websocket(ws, ConnectionInfo::websocket(remote_addr)))
}

/// Dials a WebSocket URL such as `ws://127.0.0.1:7600`
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Get the target URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        debug!("Connecting to {}", self.url);
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {}", self.url, e)))?;

        let remote_addr = match ws.get_ref() {
            tokio_tungstenite::MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };
        Ok(from_websocket(ws, ConnectionInfo::websocket(remote_addr)))
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

/// Accepts WebSocket connections on a TCP port
///
/// Upgrades run on their own tasks so a slow peer never blocks the accept
/// loop; only completed upgrades are returned from [`Acceptor::accept`].
pub struct WsListener {
    local_addr: SocketAddr,
    upgraded: mpsc::Receiver<Transport>,
    accept_task: JoinHandle<()>,
}

impl WsListener {
    /// Bind to the given address
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, upgraded) = mpsc::channel(64);

        info!("Listening for WebSocket connections on {}", local_addr);
        let accept_task = tokio::spawn(Self::accept_loop(listener, tx));

        Ok(Self {
            local_addr,
            upgraded,
            accept_task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Transport>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    continue;
                }
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(UPGRADE_TIMEOUT, accept(stream)).await {
                    Ok(Ok(transport)) => {
                        // Receiver gone means the listener was dropped
                        let _ = tx.send(transport).await;
                    }
                    Ok(Err(e)) => warn!("WebSocket upgrade from {} failed: {}", addr, e),
                    Err(_) => warn!("WebSocket upgrade from {} timed out", addr),
                }
            });
        }
    }
}

#[async_trait]
impl Acceptor for WsListener {
    async fn accept(&mut self) -> Result<Transport, TransportError> {
        self.upgraded.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
