//! Listener and acknowledgment bookkeeping shared by the transports.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::traits::{AckCallback, DisconnectListener, DisconnectReason, EventListener};

/// Lock a mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct DisconnectState {
    /// Set once the connection has gone away.
    reason: Option<DisconnectReason>,
    waiting: Vec<DisconnectListener>,
}

/// Event and disconnect listeners of one connection.
#[derive(Default)]
pub(crate) struct ListenerSet {
    events: DashMap<String, Vec<EventListener>>,
    disconnect: Mutex<DisconnectState>,
}

impl ListenerSet {
    pub(crate) fn add(&self, event: &str, listener: EventListener) {
        self.events
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events.get(event).map(|l| l.len()).unwrap_or(0)
    }

    /// Hand `payload` to every listener of `event`, in registration order.
    ///
    /// Returns the number of listeners invoked.
    pub(crate) fn dispatch(&self, event: &str, payload: Value) -> usize {
        // Clone the list out so listeners may register more listeners.
        let listeners = match self.events.get(event) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!(event = %event, "No listener for event");
                return 0;
            }
        };

        for listener in &listeners {
            listener(payload.clone());
        }
        listeners.len()
    }

    /// Register a disconnect listener.
    ///
    /// A listener registered after the connection went away fires right
    /// away with the recorded reason.
    pub(crate) fn add_disconnect(&self, listener: DisconnectListener) {
        let reason = {
            let mut state = lock(&self.disconnect);
            match state.reason.clone() {
                Some(reason) => reason,
                None => {
                    state.waiting.push(listener);
                    return;
                }
            }
        };
        listener(reason);
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        lock(&self.disconnect).waiting.len()
    }

    /// Fire the disconnect listeners, unless they already fired.
    ///
    /// Returns `true` if this call fired them.
    pub(crate) fn fire_disconnect(&self, reason: &DisconnectReason) -> bool {
        let listeners = {
            let mut state = lock(&self.disconnect);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.waiting)
        };

        for listener in listeners {
            listener(reason.clone());
        }
        true
    }
}

/// Acknowledgment callbacks waiting for the remote side, keyed by request id.
pub(crate) struct PendingAcks {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, AckCallback>>,
}

impl Default for PendingAcks {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingAcks {
    /// Park a callback and return the request id it answers to.
    pub(crate) fn register(&self, callback: AckCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.waiting).insert(id, callback);
        id
    }

    /// Invoke the callback waiting on `id`, if any.
    pub(crate) fn resolve(&self, id: u64, payload: Value) -> bool {
        let callback = lock(&self.waiting).remove(&id);
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }

    pub(crate) fn discard(&self, id: u64) -> bool {
        lock(&self.waiting).remove(&id).is_some()
    }

    pub(crate) fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *lock(&self.waiting));
        dropped.len()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.waiting).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_dispatch_reaches_every_listener() {
        let set = ListenerSet::default();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            set.add(
                "update",
                Arc::new(move |_: Value| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        assert_eq!(set.count("update"), 3);
        assert_eq!(set.dispatch("update", json!(1)), 3);
        assert_eq!(set.dispatch("other", json!(1)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_disconnect_fires_once() {
        let set = ListenerSet::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        set.add_disconnect(Arc::new(move |_: DisconnectReason| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(set.fire_disconnect(&DisconnectReason::TransportClosed));
        assert!(!set.fire_disconnect(&DisconnectReason::ClientDisconnect));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_disconnect_listener_fires_immediately() {
        let set = ListenerSet::default();
        set.fire_disconnect(&DisconnectReason::ConnectFailed("refused".into()));

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        set.add_disconnect(Arc::new(move |reason: DisconnectReason| *lock(&slot) = Some(reason)));

        assert_eq!(
            *lock(&seen),
            Some(DisconnectReason::ConnectFailed("refused".into()))
        );
        assert_eq!(set.disconnect_count(), 0);
    }

    #[test]
    fn test_pending_acks_resolve_once() {
        let acks = PendingAcks::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let id = acks.register(Box::new(move |v: Value| lock(&sink).push(v)));
        let other = acks.register(Box::new(|_: Value| {}));
        assert_ne!(id, other);

        assert!(acks.resolve(id, json!("ok")));
        assert!(!acks.resolve(id, json!("again")));
        assert!(acks.discard(other));
        assert_eq!(acks.len(), 0);
        assert_eq!(*lock(&seen), vec![json!("ok")]);
    }
}
