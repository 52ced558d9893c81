//! JSON framing for the signaling channel.
//!
//! Wire format: one UTF-8 JSON object per WebSocket frame, `type` as the
//! discriminator.

use crate::error::{ProtocolError, RelayResult};
use crate::messages::{ClientMessage, CLIENT_MESSAGE_TYPES};
use serde_json::Value;

/// Encode a serializable message into a text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> RelayResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode an inbound text frame into a typed client message.
///
/// A frame that is not a JSON object with a string `type` is
/// [`ProtocolError::Malformed`]; a well-formed frame with a `type` outside
/// the client vocabulary is [`ProtocolError::UnknownType`].
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;

    let kind = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::Malformed)?;

    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|_| ProtocolError::Malformed)
}
