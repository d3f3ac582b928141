//! Pipeline-wide error types.

use thiserror::Error;

/// Pipeline-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Realtime error: {0}")]
    Realtime(#[from] realtime_channel::RealtimeError),

    /// The platform has no push registration API.
    #[error("Push notifications are not supported on this device")]
    PushUnsupported,

    /// Notification permission is not granted.
    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Push error: {0}")]
    Push(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn push(msg: impl Into<String>) -> Self {
        Self::Push(msg.into())
    }
}
