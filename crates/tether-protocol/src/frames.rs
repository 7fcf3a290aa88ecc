//! Frame types for the Tether protocol.
//!
//! Frames are the fundamental unit of communication between a Tether client
//! and the endpoint it talks to. Each frame is serialized using MessagePack;
//! event payloads are carried as arbitrary JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Event = 0x03,
    Ack = 0x04,
    Error = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    Disconnect = 0x08,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Event),
            0x04 => Ok(FrameType::Ack),
            0x05 => Ok(FrameType::Error),
            0x06 => Ok(FrameType::Ping),
            0x07 => Ok(FrameType::Pong),
            0x08 => Ok(FrameType::Disconnect),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Session establishment, sent by the client right after the socket opens.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Optional authentication token.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Session established response.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
    },

    /// A named event, in either direction.
    #[serde(rename = "event")]
    Event {
        /// Request ID, present when the sender wants an acknowledgment.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Event name.
        event: String,
        /// Event payload.
        payload: Value,
    },

    /// Acknowledgment of an event, carrying the remote side's response.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged event.
        id: u64,
        /// Response value.
        #[serde(default)]
        payload: Value,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Sender's timestamp, echoed back in the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Session close, sent by either side before closing the socket.
    #[serde(rename = "disconnect")]
    Disconnect {
        /// Why the session is closing.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Disconnect { .. } => FrameType::Disconnect,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
        }
    }

    /// Create a new Event frame that expects no acknowledgment.
    #[must_use]
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            id: None,
            event: event.into(),
            payload,
        }
    }

    /// Create a new Event frame with ID for acknowledgment.
    #[must_use]
    pub fn event_with_ack(id: u64, event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            id: Some(id),
            event: event.into(),
            payload,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64, payload: Value) -> Self {
        Frame::Ack { id, payload }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Disconnect frame.
    #[must_use]
    pub fn disconnect(reason: Option<String>) -> Self {
        Frame::Disconnect { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let connect = Frame::connect(1, None);
        assert_eq!(connect.frame_type(), FrameType::Connect);

        let event = Frame::event("update", json!({"n": 1}));
        assert_eq!(event.frame_type(), FrameType::Event);

        let ack = Frame::ack(7, json!("ok"));
        assert_eq!(ack.frame_type(), FrameType::Ack);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x03), Ok(FrameType::Event));
        assert_eq!(u8::from(FrameType::Disconnect), 0x08);
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0x09).is_err());
    }

    #[test]
    fn test_event_with_ack_carries_id() {
        match Frame::event_with_ack(42, "vote", json!(3)) {
            Frame::Event { id, event, payload } => {
                assert_eq!(id, Some(42));
                assert_eq!(event, "vote");
                assert_eq!(payload, json!(3));
            }
            other => panic!("Expected Event frame, got {:?}", other),
        }
    }
}
