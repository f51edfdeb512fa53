//! Live sessions of one server, indexed by identity

use crate::session::SessionHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    by_identity: HashMap<String, Uuid>,
    by_id: HashMap<Uuid, SessionHandle>,
}

/// Registry enforcing one live session per identity
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the session it displaced for the same identity
    pub fn insert(&self, session: SessionHandle) -> Option<SessionHandle> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let previous = inner
            .by_identity
            .insert(session.identity().to_string(), session.id())
            .and_then(|id| inner.by_id.remove(&id));
        inner.by_id.insert(session.id(), session);
        previous
    }

    /// Remove a session if it is still the registered one for its identity
    pub fn remove(&self, session: &SessionHandle) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.remove(&session.id()).is_none() {
            return false;
        }
        if inner.by_identity.get(session.identity()) == Some(&session.id()) {
            inner.by_identity.remove(session.identity());
        }
        true
    }

    /// Look up the live session of an identity
    pub fn get(&self, identity: &str) -> Option<SessionHandle> {
        let inner = self.inner.read();
        inner
            .by_identity
            .get(identity)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Look up a session by its id
    pub fn get_by_id(&self, session_id: &Uuid) -> Option<SessionHandle> {
        self.inner.read().by_id.get(session_id).cloned()
    }

    /// Snapshot of all live sessions
    pub fn all(&self) -> Vec<SessionHandle> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut inner = self.inner.write();
        inner.by_identity.clear();
        inner.by_id.drain().map(|(_, session)| session).collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Check if no session is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
