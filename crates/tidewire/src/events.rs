//! Client-side table of event listeners
//!
//! Callers hold a stable local key. The server-issued key changes with every
//! registration, so the table maps one onto the other and is rebound after a
//! reconnect.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tidewire_proto::ListenerKey;

/// Callback invoked with the payload of each event
pub type EventCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ListenerEntry {
    event_kind: String,
    filter: Value,
    callback: EventCallback,
    server_key: Option<ListenerKey>,
}

/// Registration to replay on a new link
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Registration {
    pub(crate) local_key: ListenerKey,
    pub(crate) event_kind: String,
    pub(crate) filter: Value,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<ListenerKey, ListenerEntry>,
    by_server_key: HashMap<ListenerKey, ListenerKey>,
}

#[derive(Default)]
pub(crate) struct ListenerTable {
    inner: Mutex<Tables>,
}

impl ListenerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a listener the server accepted under `server_key`
    pub(crate) fn insert(
        &self,
        local_key: ListenerKey,
        event_kind: String,
        filter: Value,
        callback: EventCallback,
        server_key: ListenerKey,
    ) {
        let mut tables = self.inner.lock();
        tables.by_server_key.insert(server_key.clone(), local_key.clone());
        tables.entries.insert(
            local_key,
            ListenerEntry {
                event_kind,
                filter,
                callback,
                server_key: Some(server_key),
            },
        );
    }

    /// Point a listener at a fresh server key, `false` if it was removed meanwhile
    pub(crate) fn bind(&self, local_key: &ListenerKey, server_key: ListenerKey) -> bool {
        let tables = &mut *self.inner.lock();
        let Some(entry) = tables.entries.get_mut(local_key) else {
            return false;
        };

        if let Some(previous) = entry.server_key.replace(server_key.clone()) {
            tables.by_server_key.remove(&previous);
        }
        tables.by_server_key.insert(server_key, local_key.clone());
        true
    }

    /// Forget every server key; the server dropped them with the session
    pub(crate) fn unbind_all(&self) {
        let tables = &mut *self.inner.lock();
        tables.by_server_key.clear();
        for entry in tables.entries.values_mut() {
            entry.server_key = None;
        }
    }

    /// Drop a listener, returning its current server key
    pub(crate) fn remove(&self, local_key: &ListenerKey) -> Option<Option<ListenerKey>> {
        let tables = &mut *self.inner.lock();
        let entry = tables.entries.remove(local_key)?;
        if let Some(server_key) = &entry.server_key {
            tables.by_server_key.remove(server_key);
        }
        Some(entry.server_key)
    }

    /// Callback for an event addressed to `server_key`
    pub(crate) fn callback(&self, server_key: &ListenerKey) -> Option<EventCallback> {
        let tables = self.inner.lock();
        let local_key = tables.by_server_key.get(server_key)?;
        tables.entries.get(local_key).map(|entry| entry.callback.clone())
    }

    /// Every listener, for re-registration
    pub(crate) fn registrations(&self) -> Vec<Registration> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(local_key, entry)| Registration {
                local_key: local_key.clone(),
                event_kind: entry.event_kind.clone(),
                filter: entry.filter.clone(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, local_key: &ListenerKey) -> bool {
        self.inner.lock().entries.contains_key(local_key)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn noop() -> EventCallback {
        Arc::new(|_payload: Value| async { Ok::<_, anyhow::Error>(()) }.boxed())
    }

    #[test]
    fn test_lookup_by_server_key() {
        let table = ListenerTable::new();
        let local = ListenerKey::generate();
        table.insert(
            local.clone(),
            "Notify".to_string(),
            json!({"room": "A"}),
            noop(),
            "s1".into(),
        );

        assert!(table.callback(&"s1".into()).is_some());
        assert!(table.callback(&local).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rebind_after_reconnect() {
        let table = ListenerTable::new();
        let local = ListenerKey::generate();
        table.insert(local.clone(), "Notify".to_string(), json!(null), noop(), "s1".into());

        table.unbind_all();
        assert!(table.callback(&"s1".into()).is_none());
        assert!(table.contains(&local));

        let registrations = table.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].local_key, local);
        assert_eq!(registrations[0].event_kind, "Notify");

        assert!(table.bind(&local, "s2".into()));
        assert!(table.callback(&"s2".into()).is_some());
        assert!(!table.bind(&ListenerKey::generate(), "s3".into()));
    }

    #[test]
    fn test_remove() {
        let table = ListenerTable::new();
        let local = ListenerKey::generate();
        table.insert(local.clone(), "Notify".to_string(), json!(null), noop(), "s1".into());

        assert_eq!(table.remove(&local), Some(Some("s1".into())));
        assert_eq!(table.remove(&local), None);
        assert!(table.callback(&"s1".into()).is_none());
    }
}
