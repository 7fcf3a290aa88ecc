//! # tether-core
//!
//! A single logical event channel to a realtime backend.
//!
//! This crate provides:
//!
//! - **Service** - [`ChannelService`], the connection lifecycle and emit path
//! - **Stream** - [`EventStream`], a cold multicast stream per event name
//! - **Session** - the collaborators the channel calls into when a session
//!   starts or ends
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ token  ┌────────────────┐  open   ┌─────────────┐
//! │  Credential  │───────▶│ ChannelService │────────▶│  Transport  │
//! │    Source    │        └────────────────┘         └─────────────┘
//! └──────────────┘          │           │                   │
//!                   streams │           │ disconnect        │ events
//!                           ▼           ▼                   │
//!                  ┌─────────────┐ ┌──────────────┐         │
//!                  │ EventStream │ │ SessionHooks │         │
//!                  └─────────────┘ └──────────────┘         │
//!                         ▲                                 │
//!                         └─────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{ChannelService, SessionHooks};
//! use tether_transport::WebSocketTransport;
//!
//! let channel = ChannelService::new(
//!     Arc::new(WebSocketTransport::default()),
//!     Arc::new(|| Some("token".to_string())),
//!     SessionHooks::noop(),
//! );
//! channel.connect()?;
//!
//! let mut updates = channel.get_stream("round:update")?.subscribe()?;
//! channel.emit("vote", &serde_json::json!({"points": 5}))?;
//! while let Some(payload) = updates.recv().await {
//!     println!("{payload}");
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod service;
pub mod session;
pub mod stream;

pub use service::{ChannelConfig, ChannelError, ChannelService};
pub use session::{CredentialSource, NavigationSink, SessionHooks, SessionTerminationHandler};
pub use stream::{validate_event_name, EventStream, EventSubscription, MAX_EVENT_NAME_LENGTH};

pub use tether_transport::{ConnectionId, ConnectionState, DisconnectReason};

/// Lock a mutex, recovering the data if a hook panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
