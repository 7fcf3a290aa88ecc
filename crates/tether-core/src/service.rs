//! The channel service.
//!
//! [`ChannelService`] owns at most one transport connection at a time and
//! multiplexes named event streams over it. It is an explicit context
//! object: the session owner constructs it with its collaborators and
//! shares it (typically as an `Arc`) with whatever needs channel access.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_transport::{
    AckCallback, ConnectOptions, Connection, ConnectionId, ConnectionState, DisconnectListener,
    DisconnectReason, Transport, TransportError,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::lock;
use crate::session::{CredentialSource, SessionHooks};
use crate::stream::{validate_event_name, EventStream};

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `connect` was called while a connection is live.
    #[error("Channel is already connected; reset it first")]
    AlreadyConnected,

    /// The operation needs a live connection.
    #[error("Channel is not connected")]
    NotConnected,

    /// Invalid event name.
    #[error("Invalid event name: {0}")]
    InvalidEventName(&'static str),

    /// The stream belongs to a connection that was reset.
    #[error("Stream for event '{0}' belongs to a connection that was reset")]
    StaleStream(String),

    /// A payload could not be converted to or from JSON.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The transport gave up on an acknowledgment.
    #[error("Acknowledgment dropped before it arrived")]
    AckDropped,

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Endpoint handed to the transport on connect.
    pub endpoint: String,
    /// Destination given to the navigation sink when the session ends.
    pub home_route: String,
    /// Per-stream broadcast capacity.
    pub stream_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            home_route: "/".to_string(),
            stream_capacity: 1024,
        }
    }
}

/// A connection handle and the flag its session hooks fire through.
struct Handle {
    connection: Arc<dyn Connection>,
    /// Shared with the connection's disconnect listener; set by whichever
    /// side runs the hooks first.
    hooks_fired: Arc<AtomicBool>,
}

/// One logical connection and the event streams multiplexed over it.
pub struct ChannelService {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    hooks: SessionHooks,
    /// The connection handle; stays in place after a transport-side
    /// disconnect until `reset` or the next `connect`.
    connection: Mutex<Option<Handle>>,
    /// Stream registry, keyed by event name.
    streams: DashMap<String, EventStream>,
}

impl ChannelService {
    /// Create a new channel service with default configuration.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        hooks: SessionHooks,
    ) -> Self {
        Self::with_config(ChannelConfig::default(), transport, credentials, hooks)
    }

    /// Create a new channel service with custom configuration.
    #[must_use]
    pub fn with_config(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        hooks: SessionHooks,
    ) -> Self {
        debug!(transport = transport.name(), "Creating channel with config: {:?}", config);
        Self {
            config,
            transport,
            credentials,
            hooks,
            connection: Mutex::new(None),
            streams: DashMap::new(),
        }
    }

    /// Get the channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Open the connection.
    ///
    /// A connection left behind by a transport-side disconnect is released
    /// first, together with every stream bound to it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyConnected`] if a connection is live or
    /// still handshaking, or a transport error if the connection cannot be
    /// opened.
    pub fn connect(&self) -> Result<(), ChannelError> {
        let stale = {
            let mut slot = lock(&self.connection);
            let live = slot
                .as_ref()
                .is_some_and(|h| h.connection.state() != ConnectionState::Disconnected);
            if live {
                return Err(ChannelError::AlreadyConnected);
            }
            slot.take()
        };

        if let Some(stale) = stale {
            debug!(connection = %stale.connection.id(), "Releasing stale connection");
            self.release(stale);
            self.clear_streams();
        }

        let options = ConnectOptions::with_token(self.credentials.token());
        let has_token = options.token.is_some();
        let connection = self.transport.open(&self.config.endpoint, options)?;

        // Store the handle before registering the listener: a listener on an
        // already dead connection fires immediately and may call `reset`.
        let hooks_fired = Arc::new(AtomicBool::new(false));
        *lock(&self.connection) = Some(Handle {
            connection: Arc::clone(&connection),
            hooks_fired: Arc::clone(&hooks_fired),
        });
        connection.on_disconnect(self.disconnect_listener(connection.id().clone(), hooks_fired));

        info!(
            connection = %connection.id(),
            endpoint = %self.config.endpoint,
            has_token = has_token,
            "Channel connecting"
        );
        Ok(())
    }

    fn disconnect_listener(&self, id: ConnectionId, fired: Arc<AtomicBool>) -> DisconnectListener {
        let hooks = self.hooks.clone();
        let home = self.config.home_route.clone();

        Arc::new(move |reason: DisconnectReason| {
            if fired.swap(true, Ordering::SeqCst) {
                trace!(connection = %id, reason = %reason, "Session hooks already ran");
                return;
            }
            info!(connection = %id, reason = %reason, "Channel disconnected");
            hooks.terminate(&home);
        })
    }

    /// Check if the connection is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|h| h.connection.is_connected())
    }

    /// Identifier of the current connection handle, stale or not.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.connection)
            .as_ref()
            .map(|h| h.connection.id().clone())
    }

    /// The current handle, unless absent or already disconnected.
    fn live_connection(&self) -> Result<Arc<dyn Connection>, ChannelError> {
        lock(&self.connection)
            .as_ref()
            .map(|h| &h.connection)
            .filter(|c| c.state() != ConnectionState::Disconnected)
            .cloned()
            .ok_or(ChannelError::NotConnected)
    }

    /// Get the stream of payloads pushed under `event`.
    ///
    /// Repeated calls on the same connection return the same stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the event name is invalid or there is no live
    /// connection to bind the stream to.
    pub fn get_stream(&self, event: &str) -> Result<EventStream, ChannelError> {
        validate_event_name(event).map_err(ChannelError::InvalidEventName)?;
        let connection = self.live_connection()?;

        let stream = self
            .streams
            .entry(event.to_string())
            .or_insert_with(|| {
                debug!(event = %event, connection = %connection.id(), "Creating stream");
                EventStream::new(event, &connection, self.config.stream_capacity)
            })
            .clone();

        Ok(stream)
    }

    /// Number of streams in the registry.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Emit `payload` under `event` without asking for an acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns an error if the event name is invalid, the payload does not
    /// serialize, there is no live connection, or the transport refuses.
    pub fn emit<T>(&self, event: &str, payload: &T) -> Result<(), ChannelError>
    where
        T: Serialize + ?Sized,
    {
        self.send(event, serde_json::to_value(payload)?, None)
    }

    /// Emit `payload` under `event`; `on_ack` receives the remote side's
    /// acknowledgment.
    ///
    /// `on_ack` runs at most once, on the transport's scheduling, and may
    /// run after a `reset` if the acknowledgment was already in flight.
    ///
    /// # Errors
    ///
    /// Same as [`ChannelService::emit`].
    pub fn emit_with_ack<T, F>(&self, event: &str, payload: &T, on_ack: F) -> Result<(), ChannelError>
    where
        T: Serialize + ?Sized,
        F: FnOnce(Value) + Send + 'static,
    {
        self.send(event, serde_json::to_value(payload)?, Some(Box::new(on_ack)))
    }

    /// Emit `payload` under `event` and wait for the acknowledgment.
    ///
    /// # Errors
    ///
    /// Same as [`ChannelService::emit`], plus [`ChannelError::AckDropped`]
    /// if the transport discards the pending acknowledgment.
    pub async fn request<T>(&self, event: &str, payload: &T) -> Result<Value, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        self.emit_with_ack(event, payload, move |response| {
            let _ = tx.send(response);
        })?;
        rx.await.map_err(|_| ChannelError::AckDropped)
    }

    fn send(
        &self,
        event: &str,
        payload: Value,
        ack: Option<AckCallback>,
    ) -> Result<(), ChannelError> {
        validate_event_name(event).map_err(ChannelError::InvalidEventName)?;
        let connection = self.live_connection()?;

        let wants_ack = ack.is_some();
        connection.emit(event, payload, ack)?;
        trace!(event = %event, connection = %connection.id(), ack = wants_ack, "Emitted");
        Ok(())
    }

    /// Return to the initial state.
    ///
    /// Disconnects a live connection and runs the session hooks like any
    /// other disconnect, then closes and drops every stream. The hooks have
    /// run by the time this returns, even on transports that report the
    /// disconnect later. Safe to call repeatedly and from within the hooks.
    pub fn reset(&self) {
        let handle = lock(&self.connection).take();
        if let Some(handle) = handle {
            self.release(handle);
        }

        let closed = self.clear_streams();
        debug!(streams = closed, "Channel reset");
    }

    /// Disconnect a handle taken out of the slot and make sure its session
    /// hooks ran exactly once.
    fn release(&self, handle: Handle) {
        let Handle {
            connection,
            hooks_fired,
        } = handle;

        if connection.state() != ConnectionState::Disconnected {
            debug!(connection = %connection.id(), "Disconnecting");
            connection.disconnect();
        }

        // The transport may report the disconnect from its own task later;
        // that notification then finds the flag set.
        if !hooks_fired.swap(true, Ordering::SeqCst) {
            info!(connection = %connection.id(), "Channel released");
            self.hooks.terminate(&self.config.home_route);
        }
    }

    fn clear_streams(&self) -> usize {
        let streams: Vec<EventStream> = self.streams.iter().map(|e| e.value().clone()).collect();
        self.streams.clear();

        for stream in &streams {
            stream.close();
        }
        streams.len()
    }
}

impl std::fmt::Debug for ChannelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelService")
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .field("connection", &self.connection_id())
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};
    use tether_transport::{EventListener, MemoryTransport};

    /// Records what the session hooks were asked to do.
    #[derive(Default)]
    struct Recorder {
        resets: AtomicUsize,
        routes: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn resets(&self) -> usize {
            self.resets.load(Ordering::SeqCst)
        }

        fn routes(&self) -> Vec<String> {
            lock(&self.routes).clone()
        }

        fn hooks(self: &Arc<Self>) -> SessionHooks {
            let on_reset = Arc::clone(self);
            let on_navigate = Arc::clone(self);
            SessionHooks::new(
                move || {
                    on_reset.resets.fetch_add(1, Ordering::SeqCst);
                },
                move |dest: &str| lock(&on_navigate.routes).push(dest.to_string()),
            )
        }
    }

    fn setup(transport: &Arc<MemoryTransport>) -> (ChannelService, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let service = ChannelService::new(
            transport.clone(),
            Arc::new(|| Some("tok1".to_string())),
            recorder.hooks(),
        );
        (service, recorder)
    }

    /// Memory connections whose local disconnect is only reported once the
    /// peer drops the connection, the way a socket task reports it later.
    #[derive(Default)]
    struct DeferredTransport {
        inner: MemoryTransport,
    }

    struct DeferredConnection {
        inner: Arc<dyn Connection>,
        closed: AtomicBool,
    }

    impl Transport for DeferredTransport {
        fn open(
            &self,
            endpoint: &str,
            options: ConnectOptions,
        ) -> Result<Arc<dyn Connection>, TransportError> {
            let inner = self.inner.open(endpoint, options)?;
            Ok(Arc::new(DeferredConnection {
                inner,
                closed: AtomicBool::new(false),
            }))
        }

        fn name(&self) -> &'static str {
            "deferred"
        }
    }

    impl Connection for DeferredConnection {
        fn id(&self) -> &ConnectionId {
            self.inner.id()
        }

        fn state(&self) -> ConnectionState {
            if self.closed.load(Ordering::SeqCst) {
                ConnectionState::Disconnected
            } else {
                self.inner.state()
            }
        }

        fn on(&self, event: &str, listener: EventListener) {
            self.inner.on(event, listener);
        }

        fn on_disconnect(&self, listener: DisconnectListener) {
            self.inner.on_disconnect(listener);
        }

        fn emit(
            &self,
            event: &str,
            payload: Value,
            ack: Option<AckCallback>,
        ) -> Result<(), TransportError> {
            self.inner.emit(event, payload, ack)
        }

        fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn listener_count(&self, event: &str) -> usize {
            self.inner.listener_count(event)
        }
    }

    #[test]
    fn test_connect_presents_token() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);

        assert!(!service.is_connected());
        service.connect().unwrap();
        assert!(service.is_connected());

        let peer = transport.last_peer().unwrap();
        assert_eq!(peer.token(), Some("tok1"));
        assert_eq!(peer.endpoint(), ChannelConfig::default().endpoint);
        assert_eq!(peer.disconnect_listener_count(), 1);
        assert_eq!(service.connection_id().as_ref(), Some(peer.id()));
    }

    #[test]
    fn test_connect_twice_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let service = ChannelService::new(
            transport.clone(),
            Arc::new(|| None::<String>),
            SessionHooks::noop(),
        );

        service.connect().unwrap();
        assert!(matches!(service.connect(), Err(ChannelError::AlreadyConnected)));
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn test_connect_while_handshaking_fails() {
        let transport = Arc::new(MemoryTransport::with_pending_handshake());
        let (service, _) = setup(&transport);

        service.connect().unwrap();
        assert!(!service.is_connected());
        assert!(matches!(service.connect(), Err(ChannelError::AlreadyConnected)));

        transport.last_peer().unwrap().accept();
        assert!(service.is_connected());
    }

    #[test]
    fn test_get_stream_is_memoized() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);
        service.connect().unwrap();
        let peer = transport.last_peer().unwrap();

        let first = service.get_stream("x").unwrap();
        let _sub_a = first.subscribe().unwrap();
        for _ in 0..5 {
            let again = service.get_stream("x").unwrap();
            assert_eq!(again, first);
            let _sub = again.subscribe().unwrap();
        }

        assert_eq!(peer.listener_count("x"), 1);
        assert_eq!(service.stream_count(), 1);
        assert_ne!(service.get_stream("y").unwrap(), first);
    }

    #[test]
    fn test_operations_without_connection_fail_fast() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);

        assert!(matches!(service.get_stream("x"), Err(ChannelError::NotConnected)));
        assert!(matches!(service.emit("x", &1), Err(ChannelError::NotConnected)));
        assert_eq!(service.stream_count(), 0);
    }

    #[test]
    fn test_invalid_event_names_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);
        service.connect().unwrap();

        assert!(matches!(
            service.get_stream(""),
            Err(ChannelError::InvalidEventName(_))
        ));
        assert!(matches!(
            service.emit("disconnect", &json!(null)),
            Err(ChannelError::InvalidEventName(_))
        ));
    }

    #[test]
    fn test_reset_returns_to_initial_state() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, recorder) = setup(&transport);
        service.connect().unwrap();

        let before = service.get_stream("update").unwrap();
        let mut sub = before.subscribe().unwrap();

        service.reset();
        assert!(!service.is_connected());
        assert_eq!(service.connection_id(), None);
        assert_eq!(service.stream_count(), 0);
        assert!(before.is_closed());
        assert!(sub.try_recv().is_none());
        assert!(matches!(before.subscribe(), Err(ChannelError::StaleStream(_))));

        // The local disconnect runs the session hooks like any other.
        assert_eq!(recorder.resets(), 1);

        service.reset();
        assert_eq!(recorder.resets(), 1);

        service.connect().unwrap();
        let after = service.get_stream("update").unwrap();
        assert_ne!(after, before);
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn test_reset_without_connection_is_harmless() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, recorder) = setup(&transport);

        service.reset();
        assert!(!service.is_connected());
        assert_eq!(recorder.resets(), 0);
        assert!(recorder.routes().is_empty());
    }

    #[test]
    fn test_transport_disconnect_runs_hooks_once() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, recorder) = setup(&transport);
        service.connect().unwrap();
        let peer = transport.last_peer().unwrap();

        peer.drop_connection(DisconnectReason::TransportError("connection reset".into()));
        peer.drop_connection(DisconnectReason::ServerDisconnect(None));

        assert!(!service.is_connected());
        assert_eq!(recorder.resets(), 1);
        assert_eq!(recorder.routes(), vec!["/".to_string()]);

        // The stale handle is still held until reset.
        assert!(service.connection_id().is_some());
        assert!(matches!(service.get_stream("x"), Err(ChannelError::NotConnected)));

        service.reset();
        assert_eq!(recorder.resets(), 1);
        assert_eq!(service.connection_id(), None);
    }

    #[test]
    fn test_connect_replaces_stale_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);
        service.connect().unwrap();

        let old_stream = service.get_stream("update").unwrap();
        transport
            .last_peer()
            .unwrap()
            .drop_connection(DisconnectReason::TransportClosed);

        service.connect().unwrap();
        assert!(service.is_connected());
        assert!(old_stream.is_closed());
        assert_eq!(service.stream_count(), 0);
        assert_ne!(service.get_stream("update").unwrap(), old_stream);
    }

    #[test]
    fn test_emit_with_ack_delivers_acknowledged_value() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);
        service.connect().unwrap();
        let peer = transport.last_peer().unwrap();

        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&acks);
        service
            .emit_with_ack("vote", &json!({"points": 5}), move |v| lock(&sink).push(v))
            .unwrap();
        service.emit("note", "no ack wanted").unwrap();

        let emitted = peer.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].payload, json!({"points": 5}));
        assert_eq!(emitted[1].payload, json!("no ack wanted"));
        assert_eq!(emitted[1].ack_id, None);
        assert_eq!(peer.pending_acks(), 1);

        peer.ack(emitted[0].ack_id.unwrap(), json!({"accepted": true}));
        assert_eq!(*lock(&acks), vec![json!({"accepted": true})]);
    }

    #[test]
    fn test_late_ack_after_reset() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);
        service.connect().unwrap();
        let peer = transport.last_peer().unwrap();

        let acked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acked);
        service
            .emit_with_ack("vote", &3, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        service.reset();
        let ack_id = peer.emitted()[0].ack_id.unwrap();
        assert!(peer.ack(ack_id, json!("late")));

        assert_eq!(acked.load(Ordering::SeqCst), 1);
        assert!(!service.is_connected());
        assert_eq!(service.stream_count(), 0);
    }

    #[test]
    fn test_late_disconnect_leaves_new_session_alone() {
        let transport = Arc::new(DeferredTransport::default());
        let token = Arc::new(Mutex::new(Some("tok1".to_string())));
        let recorder = Arc::new(Recorder::default());

        let credentials = Arc::clone(&token);
        let cleared = Arc::clone(&token);
        let on_reset = Arc::clone(&recorder);
        let on_navigate = Arc::clone(&recorder);
        let hooks = SessionHooks::new(
            move || {
                lock(&cleared).take();
                on_reset.resets.fetch_add(1, Ordering::SeqCst);
            },
            move |dest: &str| lock(&on_navigate.routes).push(dest.to_string()),
        );
        let service = ChannelService::new(
            transport.clone(),
            Arc::new(move || lock(&credentials).clone()),
            hooks,
        );

        service.connect().unwrap();
        let old_peer = transport.inner.last_peer().unwrap();

        // The hooks run on reset, before the transport reports anything.
        service.reset();
        assert_eq!(recorder.resets(), 1);
        assert_eq!(recorder.routes(), vec!["/".to_string()]);
        assert_eq!(*lock(&token), None);

        *lock(&token) = Some("tok2".to_string());
        service.connect().unwrap();
        assert_eq!(transport.inner.last_peer().unwrap().token(), Some("tok2"));

        // Now the old connection reports its disconnect.
        assert!(old_peer.drop_connection(DisconnectReason::ClientDisconnect));

        assert!(service.is_connected());
        assert_eq!(recorder.resets(), 1);
        assert_eq!(recorder.routes().len(), 1);
        assert_eq!(lock(&token).as_deref(), Some("tok2"));
    }

    #[test]
    fn test_hooks_may_reset_the_service() {
        let transport = Arc::new(MemoryTransport::new());
        let slot: Arc<OnceLock<Weak<ChannelService>>> = Arc::new(OnceLock::new());

        let on_reset = Arc::clone(&slot);
        let hooks = SessionHooks::new(
            move || {
                if let Some(service) = on_reset.get().and_then(Weak::upgrade) {
                    service.reset();
                }
            },
            |_: &str| {},
        );
        let service = Arc::new(ChannelService::new(
            transport.clone(),
            Arc::new(|| None::<String>),
            hooks,
        ));
        let _ = slot.set(Arc::downgrade(&service));

        service.connect().unwrap();
        service.get_stream("update").unwrap();
        transport
            .last_peer()
            .unwrap()
            .drop_connection(DisconnectReason::TransportClosed);

        assert_eq!(service.connection_id(), None);
        assert_eq!(service.stream_count(), 0);
        assert!(transport.last_peer().unwrap().token().is_none());

        // Explicit reset from the owner re-enters nothing.
        service.connect().unwrap();
        service.reset();
        assert!(!service.is_connected());
    }

    #[tokio::test]
    async fn test_request_resolves_with_ack() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _) = setup(&transport);
        service.connect().unwrap();
        let peer = transport.last_peer().unwrap();

        let responder = tokio::spawn(async move {
            loop {
                if let Some(id) = peer.emitted().first().and_then(|e| e.ack_id) {
                    peer.ack(id, json!({"story": 42}));
                    return;
                }
                tokio::task::yield_now().await;
            }
        });

        let response = service.request("story:create", &json!({"title": "login"})).await.unwrap();
        assert_eq!(response, json!({"story": 42}));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_voting_round_scenario() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, recorder) = setup(&transport);

        service.connect().unwrap();
        let peer = transport.last_peer().unwrap();
        assert_eq!(peer.token(), Some("tok1"));
        assert!(service.is_connected());

        let first = service.get_stream("update").unwrap();
        let second = service.get_stream("update").unwrap();
        assert_eq!(first, second);

        let mut a = first.subscribe().unwrap();
        let mut b = second.subscribe().unwrap();
        assert_eq!(peer.listener_count("update"), 1);

        assert_eq!(peer.push("update", json!({"n": 1})), 1);

        assert_eq!(*a.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(*b.recv().await.unwrap(), json!({"n": 1}));
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());

        peer.drop_connection(DisconnectReason::ServerDisconnect(None));
        assert_eq!(recorder.resets(), 1);
        assert_eq!(recorder.routes(), vec!["/".to_string()]);
        assert!(!service.is_connected());
    }
}
