//! Command-line session.
//!
//! Wires a [`ChannelService`] to the process: the token lives in memory and
//! is cleared when the session ends, and the "navigation" a disconnect
//! triggers simply ends whatever command is running.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_core::{ChannelService, SessionHooks};
use tether_transport::{
    ConnectOptions, Connection, DisconnectReason, Transport, TransportError,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts the connections the inner transport has not reported closed yet.
///
/// The channel considers a connection gone as soon as it is reset; the
/// socket behind it may still be flushing.
struct TrackedTransport {
    inner: Arc<dyn Transport>,
    live: Arc<watch::Sender<usize>>,
}

impl Transport for TrackedTransport {
    fn open(
        &self,
        endpoint: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let connection = self.inner.open(endpoint, options)?;

        self.live.send_modify(|n| *n += 1);
        let live = Arc::clone(&self.live);
        connection.on_disconnect(Arc::new(move |_: DisconnectReason| {
            live.send_modify(|n| *n = n.saturating_sub(1));
        }));

        Ok(connection)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// A channel plus the process-side session state around it.
pub struct Session {
    channel: Arc<ChannelService>,
    token: Arc<Mutex<Option<String>>>,
    /// Set to the navigation destination once the session ended.
    ended: watch::Receiver<Option<String>>,
    /// Connections whose transport has not finished with them.
    live: watch::Receiver<usize>,
}

impl Session {
    /// Create a session over `transport`.
    #[must_use]
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let token = Arc::new(Mutex::new(config.token.clone()));
        let (ended_tx, ended) = watch::channel(None);
        let (live_tx, live) = watch::channel(0);
        let transport = Arc::new(TrackedTransport {
            inner: transport,
            live: Arc::new(live_tx),
        });

        let credentials = Arc::clone(&token);
        let cleared = Arc::clone(&token);
        let hooks = SessionHooks::new(
            move || {
                lock(&cleared).take();
                metrics::record_disconnect();
                debug!("Session token cleared");
            },
            move |destination: &str| {
                ended_tx.send_replace(Some(destination.to_string()));
            },
        );

        let channel = ChannelService::with_config(
            config.channel.clone(),
            transport,
            Arc::new(move || lock(&credentials).clone()),
            hooks,
        );

        Self {
            channel: Arc::new(channel),
            token,
            ended,
            live,
        }
    }

    /// The underlying channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<ChannelService> {
        &self.channel
    }

    /// Whether the session still holds a token.
    #[must_use]
    pub fn has_token(&self) -> bool {
        lock(&self.token).is_some()
    }

    /// Where the session was sent when it ended, if it has.
    #[must_use]
    pub fn destination(&self) -> Option<String> {
        self.ended.borrow().clone()
    }

    /// Open the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel refuses to connect.
    pub fn connect(&self) -> Result<()> {
        self.channel.connect().context("Failed to open channel")?;
        info!(endpoint = %self.channel.config().endpoint, "Connecting");
        Ok(())
    }

    /// Write every payload pushed under `events` to `out` as one JSON line,
    /// until the session ends or `shutdown` resolves. Resets the channel on
    /// the way out.
    ///
    /// Returns the number of payloads written.
    ///
    /// # Errors
    ///
    /// Returns an error if a stream cannot be opened or `out` fails.
    pub async fn listen<W, F>(&self, events: &[String], out: &mut W, shutdown: F) -> Result<usize>
    where
        W: Write,
        F: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut subscribed: Vec<&str> = Vec::with_capacity(events.len());
        for event in events {
            if subscribed.contains(&event.as_str()) {
                continue;
            }
            let mut subscription = self
                .channel
                .get_stream(event)
                .with_context(|| format!("Failed to open stream '{event}'"))?
                .subscribe()?;
            subscribed.push(event);

            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(payload) = subscription.recv().await {
                    if tx.send((subscription.event().to_string(), payload)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);
        info!(events = ?subscribed, "Listening");

        let mut ended = self.ended.clone();
        tokio::pin!(shutdown);
        let mut written = 0;

        loop {
            tokio::select! {
                Some((event, payload)) = rx.recv() => {
                    write_line(out, &event, &payload)?;
                    written += 1;
                }
                _ = ended.wait_for(Option::is_some) => {
                    info!("Connection ended");
                    break;
                }
                () = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        // Closing the streams lets the forwarders drain what already arrived.
        self.channel.reset();
        while let Some((event, payload)) = rx.recv().await {
            write_line(out, &event, &payload)?;
            written += 1;
        }

        Ok(written)
    }

    /// Emit `payload` under `event`. With `ack_timeout`, wait that long for
    /// the acknowledgment and return it.
    ///
    /// # Errors
    ///
    /// Returns an error if the emit fails or the acknowledgment does not
    /// arrive in time.
    pub async fn emit(
        &self,
        event: &str,
        payload: &Value,
        ack_timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        metrics::record_emit(event, ack_timeout.is_some());

        let Some(limit) = ack_timeout else {
            self.channel.emit(event, payload)?;
            return Ok(None);
        };

        let response = tokio::time::timeout(limit, self.channel.request(event, payload))
            .await
            .with_context(|| format!("Timed out waiting for acknowledgment of '{event}'"))??;
        metrics::record_ack(event);
        Ok(Some(response))
    }

    /// Reset the channel and give the transport up to `grace` to finish
    /// with its connections, so queued frames reach the wire.
    pub async fn close(&self, grace: Duration) {
        self.channel.reset();
        let mut live = self.live.clone();
        if tokio::time::timeout(grace, live.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            debug!("Transport did not confirm the disconnect in time");
        }
    }
}

fn write_line<W: Write>(out: &mut W, event: &str, payload: &Value) -> Result<()> {
    metrics::record_event(event);
    serde_json::to_writer(&mut *out, &json!({ "event": event, "payload": payload }))?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
