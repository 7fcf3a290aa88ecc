//! WebSocket transport implementation.
//!
//! Each connection is driven by one Tokio task that owns the socket. The
//! connection object handed to callers only shares state with that task and
//! queues outbound frames to it, so every operation on it is non-blocking.
//! Frames queued before the server accepts the session are held back and
//! flushed in order once it does.

use bytes::BytesMut;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tether_protocol::{codec, Frame, FrameType, Version, PROTOCOL_VERSION};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, trace, warn};

use crate::listeners::{lock, ListenerSet, PendingAcks};
use crate::traits::{
    AckCallback, ConnectOptions, Connection, ConnectionId, ConnectionState, DisconnectListener,
    DisconnectReason, EventListener, Transport, TransportError,
};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Protocol version announced in the handshake.
    pub protocol_version: Version,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// WebSocket client transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Get the transport configuration.
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

impl Transport for WebSocketTransport {
    fn open(
        &self,
        endpoint: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }

        let runtime = Handle::try_current().map_err(|_| {
            TransportError::Other("WebSocket transport requires a Tokio runtime".into())
        })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: ConnectionId::generate(),
            state: Mutex::new(ConnectionState::Connecting),
            listeners: ListenerSet::default(),
            acks: PendingAcks::default(),
        });

        debug!(connection = %shared.id, endpoint = %endpoint, "Opening WebSocket connection");

        runtime.spawn(run_connection(
            endpoint.to_string(),
            options,
            self.config.clone(),
            Arc::clone(&shared),
            outbound_rx,
        ));

        Ok(Arc::new(WebSocketConnection {
            shared,
            outbound: outbound_tx,
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// State shared between a connection handle and its socket task.
struct Shared {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    listeners: ListenerSet,
    acks: PendingAcks,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move `Connecting` to `Connected`; a closed connection stays closed.
    fn mark_connected(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Connected;
        true
    }

    fn mark_disconnected(&self) {
        *lock(&self.state) = ConnectionState::Disconnected;
    }
}

/// Commands queued from the connection handle to its socket task.
enum Outbound {
    Frame(Frame),
    Close,
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
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

        let frame = match ack {
            Some(callback) => {
                let id = self.shared.acks.register(callback);
                Frame::event_with_ack(id, event, payload)
            }
            None => Frame::event(event, payload),
        };

        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn disconnect(&self) {
        self.shared.mark_disconnected();
        // The task may already be gone; nothing left to close then.
        let _ = self.outbound.send(Outbound::Close);
    }

    fn listener_count(&self, event: &str) -> usize {
        self.shared.listeners.count(event)
    }
}

/// Drive one connection until it ends, then notify listeners.
async fn run_connection(
    endpoint: String,
    options: ConnectOptions,
    config: WebSocketConfig,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let reason = drive(&endpoint, options, &config, &shared, &mut outbound).await;

    shared.mark_disconnected();
    let dropped = shared.acks.clear();
    debug!(
        connection = %shared.id,
        reason = %reason,
        dropped_acks = dropped,
        "WebSocket connection ended"
    );
    shared.listeners.fire_disconnect(&reason);
}

async fn drive(
    endpoint: &str,
    options: ConnectOptions,
    config: &WebSocketConfig,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> DisconnectReason {
    let (stream, _response) = match connect_async(endpoint).await {
        Ok(connected) => connected,
        Err(e) => {
            error!(connection = %shared.id, error = %e, "WebSocket handshake failed");
            return DisconnectReason::ConnectFailed(e.to_string());
        }
    };

    let (mut sink, mut source) = stream.split();

    let hello = Frame::connect(config.protocol_version.wire(), options.token);
    if let Err(e) = send_frame(&mut sink, &hello).await {
        return DisconnectReason::ConnectFailed(e.to_string());
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Frames emitted before the server accepted the session.
    let mut held: Vec<Frame> = Vec::new();
    let mut established = false;

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) if !established => {
                    trace!(connection = %shared.id, held = held.len() + 1, "Holding frame until connected");
                    held.push(frame);
                }
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        warn!(connection = %shared.id, error = %e, "Failed to send frame");
                        return DisconnectReason::TransportError(e.to_string());
                    }
                }
                // A dropped handle counts as a local disconnect.
                Some(Outbound::Close) | None => {
                    let _ = send_frame(&mut sink, &Frame::disconnect(None)).await;
                    let _ = sink.close().await;
                    return DisconnectReason::ClientDisconnect;
                }
            },

            message = source.next() => {
                let data = match message {
                    Some(Ok(Message::Binary(data))) => data,
                    // For compatibility, treat text as binary
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            warn!(connection = %shared.id, error = %e, "Failed to send pong");
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                        return DisconnectReason::TransportClosed;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(connection = %shared.id, error = %e, "WebSocket error");
                        return DisconnectReason::TransportError(e.to_string());
                    }
                };

                if data.len() > config.max_message_size {
                    warn!(
                        connection = %shared.id,
                        "Message too large: {} bytes (max: {})",
                        data.len(),
                        config.max_message_size
                    );
                    return DisconnectReason::TransportError(format!(
                        "message of {} bytes exceeds limit",
                        data.len()
                    ));
                }

                read_buffer.extend_from_slice(&data);
                loop {
                    match codec::decode_from(&mut read_buffer) {
                        Ok(Some(frame)) => {
                            let frame_type = frame.frame_type();
                            trace!(connection = %shared.id, frame_type = ?frame_type, "Frame received");

                            if let Some(reason) = handle_frame(frame, config, shared, &mut sink).await {
                                return reason;
                            }

                            if frame_type == FrameType::Connected && !established {
                                established = true;
                                for frame in held.drain(..) {
                                    if let Err(e) = send_frame(&mut sink, &frame).await {
                                        warn!(connection = %shared.id, error = %e, "Failed to flush held frame");
                                        return DisconnectReason::TransportError(e.to_string());
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(connection = %shared.id, error = %e, "Undecodable frame");
                            return DisconnectReason::TransportError(e.to_string());
                        }
                    }
                }
            }
        }
    }
}

/// Apply one inbound frame. Returns a reason when the frame ends the session.
async fn handle_frame<S>(
    frame: Frame,
    config: &WebSocketConfig,
    shared: &Shared,
    sink: &mut S,
) -> Option<DisconnectReason>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match frame {
        Frame::Connected {
            connection_id,
            version,
        } => {
            if !config.protocol_version.accepts_wire(version) {
                return Some(DisconnectReason::ConnectFailed(format!(
                    "incompatible protocol version {} (local {})",
                    version, config.protocol_version
                )));
            }
            if shared.mark_connected() {
                debug!(connection = %shared.id, remote_id = %connection_id, "Session established");
            }
        }

        Frame::Event { id, event, payload } => {
            let delivered = shared.listeners.dispatch(&event, payload);
            trace!(connection = %shared.id, event = %event, listeners = delivered, "Event received");
            if id.is_some() {
                trace!(connection = %shared.id, event = %event, "Remote ack request ignored");
            }
        }

        Frame::Ack { id, payload } => {
            if !shared.acks.resolve(id, payload) {
                debug!(connection = %shared.id, id = id, "Ack for unknown request");
            }
        }

        Frame::Error { id, code, message } => {
            warn!(connection = %shared.id, id = id, code = code, message = %message, "Remote error");
            shared.acks.discard(id);
        }

        Frame::Ping { timestamp } => {
            if let Err(e) = send_frame(sink, &Frame::pong(timestamp)).await {
                return Some(DisconnectReason::TransportError(e.to_string()));
            }
        }

        Frame::Pong { .. } => {}

        Frame::Disconnect { reason } => {
            return Some(DisconnectReason::ServerDisconnect(reason));
        }

        Frame::Connect { .. } => {
            warn!(connection = %shared.id, "Unexpected connect frame from server");
        }
    }

    None
}

/// Send a frame to the WebSocket.
async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let data = codec::encode(frame)?;
    sink.send(Message::Binary(data.to_vec()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}
