//! Transport abstraction traits for Tether.
//!
//! A transport opens connections to an endpoint; a connection carries named
//! events in both directions and reports when it goes away. The channel
//! layer above only ever talks to these traits.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a locally unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, seq))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opened locally, handshake not finished yet.
    Connecting,
    /// Handshake finished; events flow.
    Connected,
    /// Closed for good. Connections never leave this state.
    Disconnected,
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `Connection::disconnect` was called locally.
    ClientDisconnect,
    /// The remote side ended the session, optionally saying why.
    ServerDisconnect(Option<String>),
    /// The underlying socket closed without a session-level goodbye.
    TransportClosed,
    /// The underlying socket failed.
    TransportError(String),
    /// The connection never got established.
    ConnectFailed(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnect => write!(f, "client disconnect"),
            Self::ServerDisconnect(Some(reason)) => write!(f, "server disconnect: {}", reason),
            Self::ServerDisconnect(None) => write!(f, "server disconnect"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {}", e),
            Self::ConnectFailed(e) => write!(f, "connect failed: {}", e),
        }
    }
}

/// Options attached to a connection when it is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Opaque authentication token sent with the session handshake.
    pub token: Option<String>,
}

impl ConnectOptions {
    /// Options carrying the given token.
    #[must_use]
    pub fn with_token(token: Option<String>) -> Self {
        Self { token }
    }
}

/// Callback receiving every payload pushed for one event name.
pub type EventListener = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback receiving the reason a connection went away.
pub type DisconnectListener = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Callback receiving the remote side's acknowledgment of one emitted event.
pub type AckCallback = Box<dyn FnOnce(Value) + Send>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The endpoint could not be used.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can open connections to an endpoint.
pub trait Transport: Send + Sync {
    /// Open a new connection.
    ///
    /// Returns as soon as the connection object exists; the handshake may
    /// still be in flight, in which case the connection reports
    /// [`ConnectionState::Connecting`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot even be started.
    fn open(
        &self,
        endpoint: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open connection over a transport.
///
/// Listener callbacks run on whatever scheduling the transport uses and may
/// be invoked concurrently with calls into the connection.
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Check if the connection is established.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a listener for payloads pushed under `event`.
    fn on(&self, event: &str, listener: EventListener);

    /// Register a listener for the end of the connection.
    ///
    /// Disconnect listeners fire at most once per connection.
    fn on_disconnect(&self, listener: DisconnectListener);

    /// Send `payload` tagged with `event`.
    ///
    /// When `ack` is given it is invoked at most once with the remote side's
    /// response to this event.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection can no longer send.
    fn emit(&self, event: &str, payload: Value, ack: Option<AckCallback>)
        -> Result<(), TransportError>;

    /// Close the connection from the local side.
    fn disconnect(&self);

    /// Number of listeners registered for `event`.
    fn listener_count(&self, event: &str) -> usize;
}
