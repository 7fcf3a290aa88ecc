//! Event streams.
//!
//! An [`EventStream`] is the registry entry for one event name on one
//! connection. It is cold: nothing is registered with the transport until
//! the first [`EventStream::subscribe`], which attaches a single transport
//! listener feeding a broadcast channel. Every later subscriber only gets a
//! new receiver on that channel, so all subscribers of an event share one
//! transport registration and observe the same payload sequence.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tether_transport::Connection;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::lock;
use crate::service::ChannelError;

/// Maximum event name length.
pub const MAX_EVENT_NAME_LENGTH: usize = 256;

/// Names the transport uses for its own lifecycle signals.
pub const RESERVED_EVENT_NAMES: &[&str] = &["connect", "disconnect", "error"];

/// Validate an event name.
///
/// # Errors
///
/// Returns an error message if the event name is invalid.
pub fn validate_event_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Event name cannot be empty");
    }
    if name.len() > MAX_EVENT_NAME_LENGTH {
        return Err("Event name too long");
    }
    if RESERVED_EVENT_NAMES.contains(&name) {
        return Err("Event name is reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Event name contains invalid characters");
    }
    Ok(())
}

struct StreamInner {
    event: String,
    /// `None` once the stream was closed by a reset.
    sender: Mutex<Option<broadcast::Sender<Arc<Value>>>>,
    /// Whether the transport listener has been registered.
    attached: AtomicBool,
    connection: Weak<dyn Connection>,
}

impl StreamInner {
    fn publish(&self, payload: Value) {
        let guard = lock(&self.sender);
        if let Some(sender) = guard.as_ref() {
            let receivers = sender.send(Arc::new(payload)).unwrap_or_default();
            trace!(event = %self.event, receivers = receivers, "Forwarded payload");
        }
    }
}

/// A cold, multicast stream of the payloads pushed for one event name.
///
/// Cloning yields another handle to the same stream; equality is identity.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl EventStream {
    pub(crate) fn new(
        event: impl Into<String>,
        connection: &Arc<dyn Connection>,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(StreamInner {
                event: event.into(),
                sender: Mutex::new(Some(sender)),
                attached: AtomicBool::new(false),
                connection: Arc::downgrade(connection),
            }),
        }
    }

    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Whether the transport listener has been attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// Whether the stream was closed by a reset of its channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.sender)
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Subscribe to the stream, activating it on first use.
    ///
    /// The subscription sees every payload that arrives after this call.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::StaleStream`] if the channel was reset since
    /// the stream was obtained.
    pub fn subscribe(&self) -> Result<EventSubscription, ChannelError> {
        let receiver = lock(&self.inner.sender)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| ChannelError::StaleStream(self.inner.event.clone()))?;

        self.activate()?;

        Ok(EventSubscription {
            event: self.inner.event.clone(),
            receiver,
        })
    }

    /// Attach the transport listener, once.
    fn activate(&self) -> Result<(), ChannelError> {
        if self.is_active() {
            return Ok(());
        }

        let connection = self
            .inner
            .connection
            .upgrade()
            .ok_or_else(|| ChannelError::StaleStream(self.inner.event.clone()))?;

        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        connection.on(
            &self.inner.event,
            Arc::new(move |payload: Value| {
                if let Some(inner) = weak.upgrade() {
                    inner.publish(payload);
                }
            }),
        );

        debug!(
            event = %self.inner.event,
            connection = %connection.id(),
            "Stream activated"
        );
        Ok(())
    }

    /// Close the stream: subscriptions drain and end, new ones are refused.
    pub(crate) fn close(&self) {
        if lock(&self.inner.sender).take().is_some() {
            debug!(event = %self.inner.event, "Stream closed");
        }
    }
}

impl PartialEq for EventStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventStream {}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("event", &self.inner.event)
            .field("active", &self.is_active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One consumer's view of an [`EventStream`].
pub struct EventSubscription {
    event: String,
    receiver: broadcast::Receiver<Arc<Value>>,
}

impl EventSubscription {
    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the stream is closed and drained. A subscriber
    /// that falls more than the stream capacity behind skips the overflow.
    pub async fn recv(&mut self) -> Option<Arc<Value>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = %self.event, skipped = skipped, "Subscriber lagged");
                }
            }
        }
    }

    /// Wait for the next payload and deserialize it.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<Result<T, ChannelError>> {
        let payload = self.recv().await?;
        Some(T::deserialize(&*payload).map_err(ChannelError::Payload))
    }

    /// Take the next payload if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Arc<Value>> {
        loop {
            match self.receiver.try_recv() {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(event = %self.event, skipped = skipped, "Subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}
