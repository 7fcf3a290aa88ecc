//! # tether-protocol
//!
//! Wire protocol definitions for the Tether event channel.
//!
//! A Tether session multiplexes named events over one duplex connection.
//! This crate defines the frames exchanged on that connection and the
//! length-prefixed MessagePack codec used to put them on the wire.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Session handshake (carries the auth token)
//! - `Event` - A named payload, optionally expecting an acknowledgment
//! - `Ack` / `Error` - Responses to acknowledged events
//! - `Ping` / `Pong` / `Disconnect` - Connection housekeeping
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use tether_protocol::{codec, Frame};
//!
//! let frame = Frame::event_with_ack(1, "vote", json!({"points": 5}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
