//! Client lifecycle signals and event listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::codec::EventPayload;
use crate::error::ClientError;

/// Something that happened on a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transport opened.
    Open,
    /// The transport closed, or a connection attempt failed.
    Close,
    /// A failure not tied to a single call.
    Error(Arc<ClientError>),
    /// The server pushed an event.
    Event {
        /// Event name.
        name: String,
        /// Event payload.
        payload: EventPayload,
    },
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&str, &EventPayload) + Send + Sync>;

/// Named and catch-all event listeners.
#[derive(Default)]
pub(crate) struct EventListeners {
    next_id: AtomicU64,
    named: RwLock<HashMap<String, Vec<(ListenerId, Callback)>>>,
    any: RwLock<Vec<(ListenerId, Callback)>>,
}

impl EventListeners {
    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn on(&self, name: impl Into<String>, callback: Callback) -> ListenerId {
        let id = self.next_id();
        self.named
            .write()
            .entry(name.into())
            .or_default()
            .push((id, callback));
        id
    }

    pub(crate) fn on_any(&self, callback: Callback) -> ListenerId {
        let id = self.next_id();
        self.any.write().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;

        self.named.write().retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(candidate, _)| *candidate != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });

        let mut any = self.any.write();
        let before = any.len();
        any.retain(|(candidate, _)| *candidate != id);
        removed | (any.len() != before)
    }

    /// Run the listeners for `name`, then the catch-all ones.
    pub(crate) fn dispatch(&self, name: &str, payload: &EventPayload) {
        // Snapshot so listeners may (un)register while running
        let named: Vec<Callback> = self
            .named
            .read()
            .get(name)
            .map(|listeners| listeners.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        let any: Vec<Callback> = self.any.read().iter().map(|(_, cb)| cb.clone()).collect();

        for callback in named.iter().chain(any.iter()) {
            callback(name, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[test]
    fn test_named_and_catch_all() {
        let listeners = EventListeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let named = seen.clone();
        listeners.on(
            "marvin",
            Arc::new(move |name: &str, _: &EventPayload| {
                named.lock().push(format!("named:{name}"));
            }),
        );
        let any = seen.clone();
        listeners.on_any(Arc::new(move |name: &str, _: &EventPayload| {
            any.lock().push(format!("any:{name}"));
        }));

        listeners.dispatch("marvin", &EventPayload::Raw(Bytes::from("42")));
        listeners.dispatch("other", &EventPayload::Empty);

        assert_eq!(
            *seen.lock(),
            vec!["named:marvin", "any:marvin", "any:other"]
        );
    }

    #[test]
    fn test_remove_listener() {
        let listeners = EventListeners::default();
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        let id = listeners.on(
            "tick",
            Arc::new(move |_: &str, _: &EventPayload| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        listeners.dispatch("tick", &EventPayload::Empty);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.dispatch("tick", &EventPayload::Empty);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
