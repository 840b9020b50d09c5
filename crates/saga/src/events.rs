//! Saga lifecycle events.
//!
//! Every observable change to a saga instance is described by a
//! [`SagaEvent`]. Events are delivered to registered listeners and
//! published to the configured events topic, forming the audit trail
//! for an instance. They are append-only facts and are never mutated
//! after publication.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

/// What happened to a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaEventKind {
    /// A new instance was created and is about to run.
    SagaStarted,
    /// A step was dispatched to its handler or target topic.
    StepStarted,
    /// A step finished successfully.
    StepCompleted,
    /// A step failed beyond its retry budget.
    StepFailed,
    /// Compensation of completed steps began.
    CompensationStarted,
    /// A completed step was undone by its compensating command.
    StepCompensated,
    /// A compensating command failed; the walk continues regardless.
    StepCompensationFailed,
    /// Every step completed; the instance is terminal.
    SagaCompleted,
    /// The failure path finished; the instance ended compensated.
    SagaFailed,
    /// The instance was cancelled by a caller.
    SagaCancelled,
    /// The instance exceeded its deadline.
    SagaTimeout,
}

impl SagaEventKind {
    /// Wire name of the event kind, matching its serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaEventKind::SagaStarted => "saga_started",
            SagaEventKind::StepStarted => "step_started",
            SagaEventKind::StepCompleted => "step_completed",
            SagaEventKind::StepFailed => "step_failed",
            SagaEventKind::CompensationStarted => "compensation_started",
            SagaEventKind::StepCompensated => "step_compensated",
            SagaEventKind::StepCompensationFailed => "step_compensation_failed",
            SagaEventKind::SagaCompleted => "saga_completed",
            SagaEventKind::SagaFailed => "saga_failed",
            SagaEventKind::SagaCancelled => "saga_cancelled",
            SagaEventKind::SagaTimeout => "saga_timeout",
        }
    }
}

impl std::fmt::Display for SagaEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lifecycle event of a saga instance.
///
/// `step_id` is present for step-level events, `data` carries a step's
/// output, and `error` carries a failure description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEvent {
    pub kind: SagaEventKind,
    pub saga_id: SagaId,
    pub definition_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Convenience constructors
impl SagaEvent {
    fn base(kind: SagaEventKind, saga_id: SagaId, definition_id: impl Into<String>) -> Self {
        Self {
            kind,
            saga_id,
            definition_id: definition_id.into(),
            step_id: None,
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    pub fn saga_started(saga_id: SagaId, definition_id: impl Into<String>) -> Self {
        Self::base(SagaEventKind::SagaStarted, saga_id, definition_id)
    }

    pub fn step_started(
        saga_id: SagaId,
        definition_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::base(SagaEventKind::StepStarted, saga_id, definition_id)
        }
    }

    pub fn step_completed(
        saga_id: SagaId,
        definition_id: impl Into<String>,
        step_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            data,
            ..Self::base(SagaEventKind::StepCompleted, saga_id, definition_id)
        }
    }

    pub fn step_failed(
        saga_id: SagaId,
        definition_id: impl Into<String>,
        step_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            error: Some(error.into()),
            ..Self::base(SagaEventKind::StepFailed, saga_id, definition_id)
        }
    }

    pub fn compensation_started(saga_id: SagaId, definition_id: impl Into<String>) -> Self {
        Self::base(SagaEventKind::CompensationStarted, saga_id, definition_id)
    }

    pub fn step_compensated(
        saga_id: SagaId,
        definition_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::base(SagaEventKind::StepCompensated, saga_id, definition_id)
        }
    }

    pub fn step_compensation_failed(
        saga_id: SagaId,
        definition_id: impl Into<String>,
        step_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            error: Some(error.into()),
            ..Self::base(SagaEventKind::StepCompensationFailed, saga_id, definition_id)
        }
    }

    pub fn saga_completed(saga_id: SagaId, definition_id: impl Into<String>) -> Self {
        Self::base(SagaEventKind::SagaCompleted, saga_id, definition_id)
    }

    pub fn saga_failed(
        saga_id: SagaId,
        definition_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(SagaEventKind::SagaFailed, saga_id, definition_id)
        }
    }

    pub fn saga_cancelled(saga_id: SagaId, definition_id: impl Into<String>) -> Self {
        Self::base(SagaEventKind::SagaCancelled, saga_id, definition_id)
    }

    pub fn saga_timeout(saga_id: SagaId, definition_id: impl Into<String>) -> Self {
        Self::base(SagaEventKind::SagaTimeout, saga_id, definition_id)
    }
}
