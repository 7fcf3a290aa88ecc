//! Protocol versioning for Tether.
//!
//! Only the major version travels on the wire (in `connect`/`connected`
//! frames); minor versions are backwards compatible by definition.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The version byte sent in handshake frames.
    #[must_use]
    pub const fn wire(&self) -> u8 {
        self.major
    }

    /// Check whether a peer announcing `wire` in its handshake can be talked to.
    #[must_use]
    pub fn accepts_wire(&self, wire: u8) -> bool {
        self.major == wire
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
