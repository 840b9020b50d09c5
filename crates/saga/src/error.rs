//! Saga error types.

use common::SagaId;
use thiserror::Error;

use crate::status::SagaStatus;

/// Errors surfaced by the orchestrator's public operations.
///
/// Step failures are not represented here: they are recovered through
/// retries and compensation, and land on
/// [`SagaInstance::error`](crate::instance::SagaInstance) instead.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The definition failed structural validation.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// No definition registered under the given ID.
    #[error("Unknown saga definition: {0}")]
    UnknownDefinition(String),

    /// A local step's command type has no registered handler.
    #[error("No step handler registered for command type: {0}")]
    UnknownCommandType(String),

    /// No instance with the given ID.
    #[error("Unknown saga instance: {0}")]
    UnknownInstance(SagaId),

    /// An instance with the given ID already exists.
    #[error("Saga instance already exists: {0}")]
    DuplicateInstance(SagaId),

    /// The instance is in the wrong state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: String,
        actual: SagaStatus,
    },

    /// Message bus error.
    #[error("Bus error: {0}")]
    Bus(#[from] bus::BusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
