//! # tether-transport
//!
//! Transport abstraction layer for the Tether event channel.
//!
//! The channel core never touches sockets. It opens a [`Connection`]
//! through a [`Transport`] and then only registers listeners, emits events
//! and disconnects. This crate provides that contract and two
//! implementations:
//!
//! - **WebSocket** - Length-prefixed MessagePack frames over a WebSocket
//! - **Memory** - An in-process peer, for tests and embedding
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_transport::{ConnectOptions, Transport, WebSocketTransport};
//!
//! let conn = WebSocketTransport::default()
//!     .open("ws://127.0.0.1:8080/ws", ConnectOptions::with_token(Some(token)))?;
//! conn.on("update", Arc::new(|payload: serde_json::Value| println!("{payload}")));
//! conn.emit("vote", serde_json::json!(5), None)?;
//! ```

mod listeners;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{EmittedEvent, MemoryPeer, MemoryTransport};
pub use traits::{
    AckCallback, ConnectOptions, Connection, ConnectionId, ConnectionState, DisconnectListener,
    DisconnectReason, EventListener, Transport, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
