//! Request/response correlation

use crate::{ClientError, Result};
use crate::error::RemoteError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tidewire_proto::{Response, ResponseState};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback receiving transfer progress of one request
pub type ProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Which half of a call is being transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The server is receiving a split request
    Upload,
    /// The client is receiving a split response
    Download,
}

/// Progress of a split message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Request or response side
    pub direction: Direction,
    /// Bytes received so far
    pub received: u64,
    /// Declared total size
    pub total: u64,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Value>>,
    on_progress: Option<ProgressFn>,
}

/// Table of requests waiting for their response
#[derive(Default)]
pub(crate) struct Router {
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a request before its frames are sent
    pub(crate) fn register(
        &self,
        request_id: Uuid,
        on_progress: Option<ProgressFn>,
    ) -> oneshot::Receiver<Result<Value>> {
        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, PendingRequest { reply, on_progress });
        rx
    }

    /// Resolve or reject the request a response belongs to
    pub(crate) fn complete(&self, response: Response) -> bool {
        let result = match response.state {
            ResponseState::Success(body) => Ok(body),
            ResponseState::Error(body) => Err(ClientError::Remote(RemoteError::from(body))),
        };
        self.resolve(response.request_id, result)
    }

    /// Reject one request
    pub(crate) fn fail(&self, request_id: Uuid, error: ClientError) -> bool {
        self.resolve(request_id, Err(error))
    }

    fn resolve(&self, request_id: Uuid, result: Result<Value>) -> bool {
        let Some(pending) = self.pending.lock().remove(&request_id) else {
            warn!("Received response for unknown request: {}", request_id);
            return false;
        };

        if pending.reply.send(result).is_err() {
            debug!("Caller of {} stopped waiting", request_id);
        }
        true
    }

    /// Report progress to the request's callback, if it has one
    pub(crate) fn progress(
        &self,
        request_id: Uuid,
        direction: Direction,
        received: u64,
        total: u64,
    ) -> bool {
        let callback = match self.pending.lock().get(&request_id) {
            Some(pending) => pending.on_progress.clone(),
            None => return false,
        };

        if let Some(callback) = callback {
            callback(TransferProgress {
                direction,
                received,
                total,
            });
        }
        true
    }

    /// Forget a request without resolving it
    pub(crate) fn remove(&self, request_id: Uuid) -> bool {
        self.pending.lock().remove(&request_id).is_some()
    }

    /// Reject every outstanding request, returning how many there were
    pub(crate) fn reject_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> ClientError,
    {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (request_id, pending) in drained {
            if pending.reply.send(Err(error())).is_err() {
                debug!("Caller of {} stopped waiting", request_id);
            }
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests;
