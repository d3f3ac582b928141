//! Realtime channel error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors raised by the realtime channel.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Transport could not be opened or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// WebSocket protocol errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Inbound frame could not be decoded
    #[error("Malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Outbound message while the socket is down.
    #[error("Realtime channel is not connected")]
    NotConnected,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RealtimeError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
