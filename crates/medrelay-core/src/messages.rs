//! Signaling control messages.
//!
//! One JSON object per frame, discriminated by its `type` field. SDP blobs,
//! ICE candidates and chat bodies are carried as opaque `serde_json::Value`s.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Maximum number of connections in one consultation room.
pub const ROOM_CAPACITY: usize = 2;

/// Role of a participant inside a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    #[default]
    Patient,
    Doctor,
}

// ── Client → server ────────────────────────────────────────────────

/// Every `type` a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "join",
    "offer",
    "answer",
    "ice-candidate",
    "leave",
    "chat",
    "screen-share",
    "recording",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join(JoinPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IceCandidatePayload),
    Leave {},
    Chat(ChatPayload),
    ScreenShare(ScreenSharePayload),
    Recording(RecordingPayload),
}

impl ClientMessage {
    /// The wire `type` of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Leave {} => "leave",
            Self::Chat(_) => "chat",
            Self::ScreenShare(_) => "screen-share",
            Self::Recording(_) => "recording",
        }
    }
}

/// `join`. Fields are optional on the wire so a missing one can be
/// reported as a protocol error instead of a parse failure. Numeric ids
/// are accepted and kept in their decimal text form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(
        default,
        alias = "consultationId",
        deserialize_with = "loose_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub room_id: Option<String>,
    #[serde(default, deserialize_with = "loose_id", skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_type: Option<ParticipantType>,
}

fn loose_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("invalid id: {other}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    #[serde(default)]
    pub offer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_participant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    #[serde(default)]
    pub answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_participant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    #[serde(default)]
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_participant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSharePayload {
    #[serde(default)]
    pub enabled: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingPayload {
    #[serde(default)]
    pub status: Value,
}

// ── Server → client ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: String,
        message: String,
    },
    Joined {
        room_id: String,
        participant_id: String,
        participant_count: usize,
    },
    UserJoined {
        participant_id: String,
        participant_type: ParticipantType,
        participant_count: usize,
    },
    ReadyToConnect {
        message: String,
    },
    Offer {
        offer: Value,
        from_participant_id: String,
    },
    Answer {
        answer: Value,
        from_participant_id: String,
    },
    IceCandidate {
        candidate: Value,
        from_participant_id: String,
    },
    UserLeft {
        participant_id: String,
        participant_count: usize,
    },
    Chat {
        message: Value,
        from_participant_id: String,
        timestamp: String,
    },
    ScreenShare {
        enabled: Value,
        from_participant_id: String,
    },
    Recording {
        status: Value,
        message: String,
    },
    Error {
        error: String,
    },
    ServerClosing {
        message: String,
    },
}

impl ServerMessage {
    pub fn welcome(connection_id: &str) -> Self {
        Self::Welcome {
            connection_id: connection_id.to_string(),
            message: "Connected to signaling server".into(),
        }
    }

    pub fn ready_to_connect() -> Self {
        Self::ReadyToConnect {
            message: "Other participant is in the room, you can create an offer".into(),
        }
    }

    /// Recording notice; any status other than `started` reads as stopped.
    pub fn recording(status: Value) -> Self {
        let message = if status.as_str() == Some("started") {
            "This consultation is being recorded"
        } else {
            "Recording has stopped"
        };
        Self::Recording {
            status,
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn server_closing() -> Self {
        Self::ServerClosing {
            message: "Server is shutting down".into(),
        }
    }
}
