//! Self-expiring accumulator for multi-frame messages

use crate::ProtocolError;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// In-progress reassembly of one correlation id
#[derive(Debug)]
pub struct ReassemblyBuffer {
    /// Message being reassembled
    pub correlation_id: Uuid,
    /// Declared size of the complete message
    pub total_size: u64,
    /// Bytes received so far
    pub received_size: u64,
    /// Received chunks by index
    chunks: BTreeMap<u32, Bytes>,
    /// Last time a frame created or extended this buffer
    last_touched: Instant,
}

impl ReassemblyBuffer {
    fn new(correlation_id: Uuid, total_size: u64, now: Instant) -> Self {
        Self {
            correlation_id,
            total_size,
            received_size: 0,
            chunks: BTreeMap::new(),
            last_touched: now,
        }
    }

    fn record(&mut self, chunk_index: u32, body: Bytes) -> Result<(), ProtocolError> {
        if self.chunks.contains_key(&chunk_index) {
            return Ok(());
        }

        let received = self.received_size + body.len() as u64;
        if received > self.total_size {
            return Err(ProtocolError::Malformed(format!(
                "chunk {} of {} overflows declared size {}",
                chunk_index, self.correlation_id, self.total_size
            )));
        }

        self.received_size = received;
        self.chunks.insert(chunk_index, body);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.received_size == self.total_size
    }

    fn assemble(self) -> Bytes {
        if self.chunks.len() == 1 {
            if let Some((_, body)) = self.chunks.into_iter().next() {
                return body;
            }
            return Bytes::new();
        }

        let mut buf = BytesMut::with_capacity(self.total_size as usize);
        for body in self.chunks.into_values() {
            buf.extend_from_slice(&body);
        }
        buf.freeze()
    }

    /// Number of distinct chunks received
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Result of recording one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// More chunks are needed
    Progress {
        /// Bytes received so far
        received: u64,
        /// Declared total size
        total: u64,
    },
    /// All chunks arrived; the buffer was removed
    Complete(Bytes),
}

struct StoreInner {
    buffers: Mutex<HashMap<Uuid, ReassemblyBuffer>>,
    expire_after: Duration,
}

impl StoreInner {
    fn sweep(&self, now: Instant) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|id, buffer| {
            let keep = now.saturating_duration_since(buffer.last_touched) <= self.expire_after;
            if !keep {
                warn!(
                    "Dropping abandoned reassembly buffer {} ({}/{} bytes)",
                    id, buffer.received_size, buffer.total_size
                );
            }
            keep
        });
        before - buffers.len()
    }
}

/// Keyed store of reassembly buffers with a periodic expiry sweep
///
/// Each connection owns one store. [`ReassemblyStore::dispose`] must be called
/// when the connection is torn down; dropping the store also stops the sweep.
pub struct ReassemblyStore {
    inner: Arc<StoreInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ReassemblyStore {
    /// Create a store without a background sweep
    pub fn new(expire_after: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                buffers: Mutex::new(HashMap::new()),
                expire_after,
            }),
            sweeper: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a store that sweeps expired buffers every `gc_interval`
    ///
    /// Must be called from within a tokio runtime; outside one the store is
    /// created without a sweep.
    pub fn with_sweeper(expire_after: Duration, gc_interval: Duration) -> Self {
        let store = Self::new(expire_after);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&store.inner);
                let task = handle.spawn(Self::sweep_loop(weak, gc_interval));
                *store.sweeper.lock() = Some(task);
            }
            Err(_) => {
                warn!("No tokio runtime available, reassembly sweep disabled");
            }
        }

        store
    }

    async fn sweep_loop(inner: Weak<StoreInner>, gc_interval: Duration) {
        let mut interval = tokio::time::interval(gc_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let removed = inner.sweep(Instant::now());
            if removed > 0 {
                debug!("Reassembly sweep removed {} buffers", removed);
            }
        }
    }

    /// Record one chunk, creating the buffer on first sight of its id
    pub fn push(
        &self,
        correlation_id: Uuid,
        total_size: u64,
        chunk_index: u32,
        body: Bytes,
    ) -> Result<PushOutcome, ProtocolError> {
        let now = Instant::now();
        let mut buffers = self.inner.buffers.lock();

        let buffer = buffers
            .entry(correlation_id)
            .or_insert_with(|| ReassemblyBuffer::new(correlation_id, total_size, now));

        if buffer.total_size != total_size {
            return Err(ProtocolError::Malformed(format!(
                "frame for {} declares size {} but buffer expects {}",
                correlation_id, total_size, buffer.total_size
            )));
        }

        if let Err(e) = buffer.record(chunk_index, body) {
            // Drop a buffer the rejected frame would have created
            if buffer.received_size == 0 {
                buffers.remove(&correlation_id);
            }
            return Err(e);
        }
        buffer.last_touched = now;

        if buffer.is_complete() {
            let buffer = buffers
                .remove(&correlation_id)
                .ok_or_else(|| ProtocolError::Malformed("reassembly buffer vanished".to_string()))?;
            return Ok(PushOutcome::Complete(buffer.assemble()));
        }

        Ok(PushOutcome::Progress {
            received: buffer.received_size,
            total: buffer.total_size,
        })
    }

    /// Remove a buffer, returning whether it existed
    pub fn remove(&self, correlation_id: &Uuid) -> bool {
        self.inner.buffers.lock().remove(correlation_id).is_some()
    }

    /// Check whether a buffer exists for the id
    pub fn contains(&self, correlation_id: &Uuid) -> bool {
        self.inner.buffers.lock().contains_key(correlation_id)
    }

    /// Bytes received so far for the id
    pub fn received_size(&self, correlation_id: &Uuid) -> Option<u64> {
        self.inner
            .buffers
            .lock()
            .get(correlation_id)
            .map(|buffer| buffer.received_size)
    }

    /// Number of in-progress buffers
    pub fn len(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    /// Check if no message is being reassembled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every buffer untouched for longer than the expiry age
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep(Instant::now())
    }

    /// Check whether a background sweep is running
    pub fn has_sweeper(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the sweep and drop all buffers
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }

        let mut buffers = self.inner.buffers.lock();
        if !buffers.is_empty() {
            debug!("Disposing reassembly store with {} partial messages", buffers.len());
        }
        buffers.clear();
    }

    /// Check whether [`ReassemblyStore::dispose`] was called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for ReassemblyStore {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}
