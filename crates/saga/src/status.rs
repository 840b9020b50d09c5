//! Saga instance lifecycle states.

use serde::{Deserialize, Serialize};

/// Status of a saga instance.
///
/// ```text
/// Created -> Running -> Completed
///               |
///               +-> Failed -> Compensating -> Compensated
/// ```
///
/// `cancel_saga` can force any non-terminal status into `Compensating`.
/// A running instance that exceeds its deadline takes the compensation
/// path; one that exceeds it while already compensating ends in
/// `TimedOut`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// The instance exists but no step has been scheduled yet.
    #[default]
    Created,
    /// Steps are being scheduled and executed.
    Running,
    /// Every step completed. Terminal.
    Completed,
    /// A step failed beyond its retry budget; compensation is pending.
    Failed,
    /// Compensating commands for completed steps are running.
    Compensating,
    /// Compensation finished after a failure or cancellation. Terminal.
    Compensated,
    /// The instance exceeded its deadline without recovering. Terminal.
    #[serde(rename = "timeout")]
    TimedOut,
}

impl SagaStatus {
    /// Whether the scheduler may dispatch steps for the instance.
    pub fn can_schedule(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    /// Whether the instance can transition into `Compensating`.
    pub fn can_compensate(&self) -> bool {
        matches!(
            self,
            SagaStatus::Created | SagaStatus::Running | SagaStatus::Failed
        )
    }

    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::TimedOut
        )
    }

    /// Wire name of the status, matching its serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Created => "created",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::TimedOut => "timeout",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
