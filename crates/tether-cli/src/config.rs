//! Client configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (TETHER_ENDPOINT, TETHER_TOKEN)
//! - Command line arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tether_core::ChannelConfig;
use tether_transport::WebSocketConfig;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Token presented when the connection opens.
    #[serde(default = "default_token")]
    pub token: Option<String>,

    /// Channel configuration.
    #[serde(default = "default_channel")]
    pub channel: ChannelConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_token() -> Option<String> {
    std::env::var("TETHER_TOKEN").ok().filter(|t| !t.is_empty())
}

fn default_channel() -> ChannelConfig {
    let mut channel = ChannelConfig::default();
    if let Ok(endpoint) = std::env::var("TETHER_ENDPOINT") {
        channel.endpoint = endpoint;
    }
    channel
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: default_token(),
            channel: default_channel(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl TransportConfig {
    /// Settings for the WebSocket transport.
    #[must_use]
    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.max_message_size,
            ..WebSocketConfig::default()
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first default path that
    /// exists, or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen config file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = [
            "tether.toml",
            "~/.config/tether/tether.toml",
            "/etc/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply command line overrides.
    pub fn apply_overrides(&mut self, endpoint: Option<String>, token: Option<String>) {
        if let Some(endpoint) = endpoint {
            self.channel.endpoint = endpoint;
        }
        if token.is_some() {
            self.token = token;
        }
    }
}
