//! # Tether CLI
//!
//! Command-line client for a Tether event channel.
//!
//! ## Usage
//!
//! ```bash
//! # Print every "round:update" payload as a JSON line
//! tether --endpoint ws://localhost:8080/ws listen round:update
//!
//! # Emit a vote and wait for the acknowledgment
//! tether emit vote '{"points": 5}' --ack
//!
//! # Run with a config file and a token from the environment
//! TETHER_TOKEN=secret tether --config /path/to/tether.toml listen story:created
//! ```

mod config;
mod metrics;
mod session;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::WebSocketTransport;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::session::Session;

/// How long to wait for the transport to confirm a disconnect on exit.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Command-line client for Tether event channels")]
struct Cli {
    /// Path to a config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint to connect to
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Token presented on connect
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print payloads pushed under the given events until the connection drops
    Listen {
        /// Event names to subscribe to
        #[arg(required = true)]
        events: Vec<String>,
    },

    /// Emit one event
    Emit {
        /// Event name
        event: String,

        /// JSON payload
        payload: String,

        /// Wait for the remote side to acknowledge and print the response
        #[arg(long)]
        ack: bool,

        /// Acknowledgment timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout carries payloads
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_overrides(cli.endpoint, cli.token);

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let transport = Arc::new(WebSocketTransport::new(config.transport.websocket()));
    let session = Session::new(&config, transport);

    let result = run(&session, cli.command).await;
    if let Err(e) = &result {
        metrics::record_error("command");
        error!("{:#}", e);
    }
    result
}

async fn run(session: &Session, command: Command) -> Result<()> {
    session.connect()?;

    match command {
        Command::Listen { events } => {
            let written = session
                .listen(&events, &mut std::io::stdout(), shutdown_signal())
                .await?;
            session.close(CLOSE_GRACE).await;
            info!(
                payloads = written,
                destination = ?session.destination(),
                "Listen finished"
            );
        }
        Command::Emit {
            event,
            payload,
            ack,
            timeout_ms,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let timeout = ack.then(|| Duration::from_millis(timeout_ms));

            let result = session.emit(&event, &payload, timeout).await;
            session.close(CLOSE_GRACE).await;

            if let Some(response) = result? {
                println!("{response}");
            }
        }
    }

    debug!(
        connected = session.channel().is_connected(),
        token_held = session.has_token(),
        "Session closed"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
