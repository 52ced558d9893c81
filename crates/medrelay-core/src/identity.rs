//! Opaque connection identifiers.
//!
//! Every accepted socket gets a fresh 128-bit random id, hex-encoded, which
//! is also the `connectionId` announced in the `welcome` frame.

use rand::Rng;
use std::fmt;

/// Number of random bytes in a connection id (32 hex chars).
const CONNECTION_ID_BYTES: usize = 16;

/// Primary key into the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new cryptographically random connection id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONNECTION_ID_BYTES];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
