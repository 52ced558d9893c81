//! medrelay-core: Shared protocol library for the consultation signaling relay.
//!
//! Provides the typed JSON message set exchanged with WebRTC clients, the
//! frame codec, connection identifiers, and the error types.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, encode};
pub use error::{ProtocolError, RelayError, RelayResult};
pub use identity::ConnectionId;
pub use messages::{ClientMessage, ParticipantType, ServerMessage, ROOM_CAPACITY};
