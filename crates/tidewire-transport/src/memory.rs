//! In-process transport built on tokio channels

use crate::{
    Acceptor, ConnectionInfo, Connector, Transport, TransportError, WireMessage, WireSink,
    WireStream,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages buffered per direction before senders wait
const CHANNEL_CAPACITY: usize = 1024;

struct MemorySink {
    tx: Option<mpsc::Sender<WireMessage>>,
}

#[async_trait]
impl WireSink for MemorySink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            // The peer may already be gone
            let _ = tx.send(WireMessage::Close).await;
        }
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl WireStream for MemoryStream {
    async fn next_message(&mut self) -> Option<Result<WireMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Create two connected transports
pub fn pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let a = Transport::new(
        Box::new(MemorySink { tx: Some(a_tx) }),
        Box::new(MemoryStream { rx: b_rx }),
        ConnectionInfo::memory(),
    );
    let b = Transport::new(
        Box::new(MemorySink { tx: Some(b_tx) }),
        Box::new(MemoryStream { rx: a_rx }),
        ConnectionInfo::memory(),
    );
    (a, b)
}

/// Create a connector and the listener it dials
pub fn listener() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::channel(16);
    (MemoryConnector { tx }, MemoryListener { rx })
}

/// Dials a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::Sender<Transport>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        let (client, server) = pair();
        self.tx
            .send(server)
            .await
            .map_err(|_| TransportError::Connection("memory listener is closed".to_string()))?;
        debug!("Opened in-memory transport");
        Ok(client)
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

/// Receives transports dialed through a [`MemoryConnector`]
pub struct MemoryListener {
    rx: mpsc::Receiver<Transport>,
}

#[async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&mut self) -> Result<Transport, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}
