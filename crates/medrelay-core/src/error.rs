use thiserror::Error;

/// Errors produced by the relay's transport and bootstrap layers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Protocol violations reported back to the offending connection.
///
/// The `Display` text is exactly what goes out in the `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("roomId and participantId required")]
    MissingJoinFields,

    #[error("Consultation room is full")]
    RoomFull,

    #[error("Participant already in room")]
    DuplicateParticipant,

    #[error("Must join consultation first")]
    NotJoined,

    #[error("Target participant not found")]
    TargetNotFound,

    #[error("Only doctors can control recording")]
    RecordingNotAllowed,

    #[error("Server connection limit reached")]
    ConnectionLimit,

    #[error("Server is shutting down")]
    ServerClosing,

    #[error("Connection is not registered")]
    UnknownConnection,
}
