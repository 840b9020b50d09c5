use resilience::RetryClass;
use thiserror::Error;

/// Errors that can occur when interacting with the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed to persist a publish.
    #[error("Publish error on topic '{topic}': {message}")]
    Publish { topic: String, message: String },

    /// The producer has not been connected.
    #[error("Producer is not connected")]
    NotConnected,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RetryClass for BusError {
    fn class(&self) -> &str {
        match self {
            BusError::Connection(_) => "connection",
            BusError::Publish { .. } => "publish",
            BusError::NotConnected => "not_connected",
            BusError::Serialization(_) => "serialization",
        }
    }

    fn retryable_hint(&self) -> Option<bool> {
        match self {
            // Retrying without an explicit connect() cannot succeed.
            BusError::NotConnected => Some(false),
            _ => None,
        }
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
