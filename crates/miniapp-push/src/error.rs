//! Error types for the push channel.

/// Errors produced by the push server, client and protocol.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Inbound text is not a well-formed envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed envelope with a `type` outside the known set.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket error while binding or accepting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client has no open connection.
    #[error("Not connected")]
    NotConnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for PushError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// A specialized Result type for push channel operations.
pub type PushResult<T> = Result<T, PushError>;
