//! In-process transport.
//!
//! Every connection opened through a [`MemoryTransport`] has a remote side
//! represented by a [`MemoryPeer`]. The peer plays the part of the server:
//! it pushes events, answers acknowledgments and drops the connection, all
//! synchronously on the caller's thread. Useful for tests and for embedding
//! a channel in a process that has no network endpoint.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::listeners::{lock, ListenerSet, PendingAcks};
use crate::traits::{
    AckCallback, ConnectOptions, Connection, ConnectionId, ConnectionState, DisconnectListener,
    DisconnectReason, EventListener, Transport, TransportError,
};

/// An event the local side sent to its peer.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
    /// Request id to answer with [`MemoryPeer::ack`], if an ack was requested.
    pub ack_id: Option<u64>,
}

struct Shared {
    id: ConnectionId,
    endpoint: String,
    options: ConnectOptions,
    state: Mutex<ConnectionState>,
    listeners: ListenerSet,
    acks: PendingAcks,
    emitted: Mutex<Vec<EmittedEvent>>,
}

impl Shared {
    /// Move to `Disconnected` and notify listeners, once.
    fn close(&self, reason: DisconnectReason) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }

        debug!(connection = %self.id, reason = %reason, "Memory connection closed");
        self.listeners.fire_disconnect(&reason)
    }
}

/// A transport whose connections live entirely in memory.
#[derive(Default)]
pub struct MemoryTransport {
    pending_handshake: bool,
    peers: Mutex<Vec<MemoryPeer>>,
}

impl MemoryTransport {
    /// Create a transport whose connections are established immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport whose connections stay `Connecting` until
    /// [`MemoryPeer::accept`] is called.
    #[must_use]
    pub fn with_pending_handshake() -> Self {
        Self {
            pending_handshake: true,
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Remote side of the most recently opened connection.
    #[must_use]
    pub fn last_peer(&self) -> Option<MemoryPeer> {
        lock(&self.peers).last().cloned()
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        lock(&self.peers).len()
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        endpoint: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let initial = if self.pending_handshake {
            ConnectionState::Connecting
        } else {
            ConnectionState::Connected
        };

        let shared = Arc::new(Shared {
            id: ConnectionId::generate(),
            endpoint: endpoint.to_string(),
            options,
            state: Mutex::new(initial),
            listeners: ListenerSet::default(),
            acks: PendingAcks::default(),
            emitted: Mutex::new(Vec::new()),
        });

        debug!(connection = %shared.id, endpoint = %endpoint, "Memory connection opened");
        lock(&self.peers).push(MemoryPeer {
            shared: Arc::clone(&shared),
        });

        Ok(Arc::new(MemoryConnection { shared }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Local side of an in-memory connection.
pub struct MemoryConnection {
    shared: Arc<Shared>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    fn on(&self, event: &str, listener: EventListener) {
        self.shared.listeners.add(event, listener);
    }

    fn on_disconnect(&self, listener: DisconnectListener) {
        self.shared.listeners.add_disconnect(listener);
    }

    fn emit(
        &self,
        event: &str,
        payload: Value,
        ack: Option<AckCallback>,
    ) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(TransportError::ConnectionClosed);
        }

        let ack_id = ack.map(|callback| self.shared.acks.register(callback));
        lock(&self.shared.emitted).push(EmittedEvent {
            event: event.to_string(),
            payload,
            ack_id,
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.close(DisconnectReason::ClientDisconnect);
    }

    fn listener_count(&self, event: &str) -> usize {
        self.shared.listeners.count(event)
    }
}

/// Remote side of an in-memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Identifier of the connection this peer belongs to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// Endpoint the connection was opened against.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Token the local side presented when opening the connection.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.shared.options.token.as_deref()
    }

    /// Current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Finish a pending handshake.
    ///
    /// Returns `false` if the connection was not `Connecting`.
    pub fn accept(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Connected;
        true
    }

    /// Push an event to the local side.
    ///
    /// Returns the number of listeners that received it; nothing is delivered
    /// unless the connection is established.
    pub fn push(&self, event: &str, payload: Value) -> usize {
        if self.state() != ConnectionState::Connected {
            return 0;
        }
        self.shared.listeners.dispatch(event, payload)
    }

    /// Answer the event emitted with request id `ack_id`.
    ///
    /// Pending acknowledgments outlive the connection, so this also models an
    /// acknowledgment arriving after the local side has gone away.
    pub fn ack(&self, ack_id: u64, payload: Value) -> bool {
        self.shared.acks.resolve(ack_id, payload)
    }

    /// Drop the connection from the remote side.
    pub fn drop_connection(&self, reason: DisconnectReason) -> bool {
        self.shared.close(reason)
    }

    /// Everything the local side emitted, in order.
    #[must_use]
    pub fn emitted(&self) -> Vec<EmittedEvent> {
        lock(&self.shared.emitted).clone()
    }

    /// Number of listeners the local side registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.shared.listeners.count(event)
    }

    /// Number of disconnect listeners still waiting to fire.
    #[must_use]
    pub fn disconnect_listener_count(&self) -> usize {
        self.shared.listeners.disconnect_count()
    }

    /// Number of acknowledgments the local side is still waiting for.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.shared.acks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_open_records_endpoint_and_token() {
        let transport = MemoryTransport::new();
        let conn = transport
            .open("memory://room", ConnectOptions::with_token(Some("tok1".into())))
            .unwrap();

        let peer = transport.last_peer().unwrap();
        assert_eq!(peer.endpoint(), "memory://room");
        assert_eq!(peer.token(), Some("tok1"));
        assert_eq!(peer.id(), conn.id());
        assert!(conn.is_connected());
    }

    #[test]
    fn test_pending_handshake() {
        let transport = MemoryTransport::with_pending_handshake();
        let conn = transport.open("memory://", ConnectOptions::default()).unwrap();
        let peer = transport.last_peer().unwrap();

        conn.on("update", Arc::new(|_: Value| {}));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(peer.push("update", json!(1)), 0);

        assert!(peer.accept());
        assert!(!peer.accept());
        assert!(conn.is_connected());
        assert_eq!(peer.push("update", json!(1)), 1);
    }

    #[test]
    fn test_emit_with_ack() {
        let transport = MemoryTransport::new();
        let conn = transport.open("memory://", ConnectOptions::default()).unwrap();
        let peer = transport.last_peer().unwrap();

        let acked = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&acked);
        conn.emit(
            "vote",
            json!(5),
            Some(Box::new(move |v: Value| *lock(&slot) = Some(v))),
        )
        .unwrap();
        conn.emit("note", json!("hi"), None).unwrap();

        let emitted = peer.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].ack_id, None);

        let id = emitted[0].ack_id.unwrap();
        assert!(peer.ack(id, json!({"accepted": true})));
        assert_eq!(*lock(&acked), Some(json!({"accepted": true})));
    }

    #[test]
    fn test_drop_connection_notifies_once() {
        let transport = MemoryTransport::new();
        let conn = transport.open("memory://", ConnectOptions::default()).unwrap();
        let peer = transport.last_peer().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        conn.on_disconnect(Arc::new(move |reason: DisconnectReason| {
            assert_eq!(reason, DisconnectReason::TransportClosed);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(peer.drop_connection(DisconnectReason::TransportClosed));
        conn.disconnect();
        assert!(!peer.drop_connection(DisconnectReason::TransportClosed));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.emit("vote", json!(1), None),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
