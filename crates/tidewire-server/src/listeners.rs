//! Event listener registrations and filtered fan-out

use crate::registry::SessionRegistry;
use crate::session::Session;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tidewire_proto::{Event, ListenerInfo, ListenerKey, Message};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Registration {
    session_id: Uuid,
    event_kind: String,
    filter: Value,
}

/// Server-wide index of listener registrations
///
/// Every registration belongs to the session that created it and is dropped
/// with [`ListenerRegistry::remove_session`] when that session ends.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<HashMap<ListenerKey, Registration>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener owned by a session
    ///
    /// Returns `None` once the session is terminated. The check runs under the
    /// write lock, so a registration either lands before the teardown purge
    /// or not at all.
    pub fn register(
        &self,
        session: &Session,
        event_kind: impl Into<String>,
        filter: Value,
    ) -> Option<ListenerKey> {
        let mut entries = self.entries.write();
        if session.is_terminated() {
            debug!("Refusing listener for terminated session {}", session.id());
            return None;
        }

        let key = ListenerKey::generate();
        let registration = Registration {
            session_id: session.id(),
            event_kind: event_kind.into(),
            filter,
        };
        debug!(
            "Registered listener {} for '{}' on session {}",
            key,
            registration.event_kind,
            session.id()
        );
        entries.insert(key.clone(), registration);
        Some(key)
    }

    /// Drop a registration owned by `session_id`
    ///
    /// Unknown keys and keys of other sessions are left alone.
    pub fn unregister(&self, session_id: Uuid, key: &ListenerKey) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(registration) if registration.session_id == session_id => {
                entries.remove(key).is_some()
            }
            _ => false,
        }
    }

    /// Drop every registration of a session, returning how many were removed
    pub fn remove_session(&self, session_id: Uuid) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, registration| registration.session_id != session_id);
        before - entries.len()
    }

    /// Keys and filters of every registration for an event kind
    pub fn query(&self, event_kind: &str) -> Vec<ListenerInfo> {
        let mut infos: Vec<ListenerInfo> = self
            .entries
            .read()
            .iter()
            .filter(|(_, registration)| registration.event_kind == event_kind)
            .map(|(key, registration)| ListenerInfo {
                key: key.clone(),
                filter: registration.filter.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Push one event per key to its owning session, returning the number delivered
    ///
    /// Unknown keys and sessions that are gone or not writable are skipped.
    pub fn dispatch(
        &self,
        sessions: &SessionRegistry,
        keys: &[ListenerKey],
        payload: &Value,
    ) -> usize {
        let targets: Vec<(ListenerKey, Uuid)> = {
            let entries = self.entries.read();
            keys.iter()
                .filter_map(|key| {
                    entries
                        .get(key)
                        .map(|registration| (key.clone(), registration.session_id))
                })
                .collect()
        };

        let mut delivered = 0;
        for (key, session_id) in targets {
            let Some(session) = sessions.get_by_id(&session_id) else {
                debug!("Skipping listener {}: session {} is gone", key, session_id);
                continue;
            };

            let event = Message::Event(Event {
                key: key.clone(),
                payload: payload.clone(),
            });
            if session.push(&event) {
                delivered += 1;
            } else {
                debug!("Skipping listener {}: {} is not writable", key, session.identity());
            }
        }
        delivered
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_session;
    use serde_json::json;
    use tidewire_proto::{Decoded, MessageCodec, ProtocolConfig};
    use tidewire_transport::WireMessage;

    fn received_event(message: WireMessage) -> Event {
        let WireMessage::Binary(data) = message else {
            panic!("Expected binary message");
        };
        let codec = MessageCodec::without_sweeper(ProtocolConfig::default());
        match codec.decode(data).unwrap() {
            Decoded::Complete {
                message: Message::Event(event),
                ..
            } => event,
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_register_query_unregister() {
        let registry = ListenerRegistry::new();
        let (session, _rx) = test_session("client-1", 4);

        let a = registry.register(&session, "Notify", json!({"room": "A"})).unwrap();
        let b = registry.register(&session, "Notify", json!({"room": "B"})).unwrap();
        registry.register(&session, "Other", json!(null)).unwrap();
        assert_ne!(a, b);

        let infos = registry.query("Notify");
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|info| info.key == a && info.filter == json!({"room": "A"})));

        assert!(registry.unregister(session.id(), &a));
        assert!(!registry.unregister(session.id(), &a));
        assert_eq!(registry.query("Notify").len(), 1);
        assert!(registry.query("Missing").is_empty());
    }

    #[test]
    fn test_unregister_only_own_keys() {
        let registry = ListenerRegistry::new();
        let (owner, _rx1) = test_session("owner", 4);
        let (other, _rx2) = test_session("other", 4);

        let key = registry.register(&owner, "Notify", json!(null)).unwrap();
        assert!(!registry.unregister(other.id(), &key));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(owner.id(), &key));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminated_session_cannot_register() {
        let registry = ListenerRegistry::new();
        let (session, _rx) = test_session("client-1", 4);

        session.terminate();
        assert_eq!(registry.remove_session(session.id()), 0);
        assert!(registry.register(&session, "Notify", json!({"room": "A"})).is_none());
        assert!(registry.is_empty());
        assert!(registry.query("Notify").is_empty());
    }

    #[test]
    fn test_remove_session_purges_its_registrations() {
        let registry = ListenerRegistry::new();
        let (gone, _rx1) = test_session("gone", 4);
        let (kept, _rx2) = test_session("kept", 4);

        registry.register(&gone, "Notify", json!(1)).unwrap();
        registry.register(&gone, "Other", json!(2)).unwrap();
        let survivor = registry.register(&kept, "Notify", json!(3)).unwrap();

        assert_eq!(registry.remove_session(gone.id()), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.query("Notify")[0].key, survivor);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_owning_session() {
        let sessions = SessionRegistry::new();
        let listeners = ListenerRegistry::new();
        let (first, mut rx1) = test_session("first", 4);
        let (second, mut rx2) = test_session("second", 4);
        sessions.insert(first.clone());
        sessions.insert(second.clone());

        let key_a = listeners.register(&first, "Notify", json!({"room": "A"})).unwrap();
        listeners.register(&second, "Notify", json!({"room": "B"})).unwrap();

        let delivered = listeners.dispatch(&sessions, std::slice::from_ref(&key_a), &json!("data"));
        assert_eq!(delivered, 1);

        let event = received_event(rx1.recv().await.unwrap());
        assert_eq!(event.key, key_a);
        assert_eq!(event.payload, json!("data"));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_skips_unwritable_and_unknown() {
        let sessions = SessionRegistry::new();
        let listeners = ListenerRegistry::new();
        let (full, _rx_full) = test_session("full", 1);
        let (closed, _rx_closed) = test_session("closed", 4);
        let (missing, _rx_missing) = test_session("missing", 4);
        sessions.insert(full.clone());
        sessions.insert(closed.clone());

        let keys = vec![
            listeners.register(&full, "Notify", json!(null)).unwrap(),
            listeners.register(&closed, "Notify", json!(null)).unwrap(),
            listeners.register(&missing, "Notify", json!(null)).unwrap(),
            ListenerKey::from("unknown"),
        ];
        assert!(full.push(&Message::ConnectedAck));
        closed.terminate();

        assert_eq!(listeners.dispatch(&sessions, &keys, &json!(1)), 0);
    }
}
