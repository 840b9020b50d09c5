//! Saga instance state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::definition::{SagaDefinition, SagaStep};
use crate::status::SagaStatus;

/// Shared key/value state threaded through a saga's steps.
pub type SagaContext = serde_json::Map<String, serde_json::Value>;

/// The failure that sent an instance into compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaErrorInfo {
    pub message: String,
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// One execution of a saga definition.
///
/// Instances are mutated exclusively by the orchestrator and become
/// immutable once their status is terminal. A step ID appears in at
/// most one of `completed_steps` and `failed_steps`, and
/// `compensated_steps` is always a subset of `completed_steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: SagaId,
    pub definition_id: String,
    pub status: SagaStatus,
    /// Steps currently executing or awaiting an external settle.
    pub active_steps: BTreeSet<String>,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    pub compensated_steps: BTreeSet<String>,
    /// Step outputs merged with the initial input.
    pub context: SagaContext,
    pub error: Option<SagaErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    pub fn new(
        id: SagaId,
        definition_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            definition_id: definition_id.into(),
            status: SagaStatus::Created,
            active_steps: BTreeSet::new(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            compensated_steps: BTreeSet::new(),
            context: SagaContext::new(),
            error: None,
            started_at,
            ended_at: None,
        }
    }

    /// Steps whose dependencies are all completed and which have not
    /// themselves run, failed, or started.
    pub fn runnable_steps<'a>(&self, definition: &'a SagaDefinition) -> Vec<&'a SagaStep> {
        definition
            .steps
            .iter()
            .filter(|step| {
                !self.completed_steps.contains(&step.id)
                    && !self.failed_steps.contains(&step.id)
                    && !self.active_steps.contains(&step.id)
                    && step
                        .depends_on
                        .iter()
                        .all(|dependency| self.completed_steps.contains(dependency))
            })
            .collect()
    }

    /// Whether every step of the definition has completed.
    pub fn all_steps_completed(&self, definition: &SagaDefinition) -> bool {
        definition
            .steps
            .iter()
            .all(|step| self.completed_steps.contains(&step.id))
    }

    pub fn mark_step_active(&mut self, step_id: &str) {
        self.active_steps.insert(step_id.to_string());
    }

    pub fn mark_step_completed(&mut self, step_id: &str, output: Option<serde_json::Value>) {
        self.active_steps.remove(step_id);
        self.completed_steps.insert(step_id.to_string());
        if let Some(output) = output {
            self.merge_context(step_id, output);
        }
    }

    pub fn mark_step_failed(&mut self, step_id: &str) {
        self.active_steps.remove(step_id);
        self.failed_steps.insert(step_id.to_string());
    }

    pub fn mark_step_compensated(&mut self, step_id: &str) {
        self.compensated_steps.insert(step_id.to_string());
    }

    /// Merges a step output into the shared context. Object outputs
    /// merge key by key; anything else is stored under the given key.
    pub fn merge_context(&mut self, key: &str, output: serde_json::Value) {
        match output {
            serde_json::Value::Object(map) => {
                for (name, value) in map {
                    self.context.insert(name, value);
                }
            }
            other => {
                self.context.insert(key.to_string(), other);
            }
        }
    }

    /// Wall-clock duration of the instance, once it has ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|ended_at| ended_at - self.started_at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::SagaCommand;
    use serde_json::json;

    fn instance() -> SagaInstance {
        SagaInstance::new(SagaId::new(), "order-fulfillment", Utc::now())
    }

    fn step(id: &str) -> SagaStep {
        SagaStep::new(id, SagaCommand::new(format!("{id}-command"), json!({})))
    }

    fn diamond() -> SagaDefinition {
        SagaDefinition::new("diamond", "Diamond")
            .step(step("a"))
            .step(step("b"))
            .step(step("c").with_dependency("a").with_dependency("b"))
    }

    #[test]
    fn test_new_instance_starts_created() {
        let instance = instance();
        assert_eq!(instance.status, SagaStatus::Created);
        assert!(instance.completed_steps.is_empty());
        assert!(instance.error.is_none());
        assert!(instance.ended_at.is_none());
        assert!(instance.duration().is_none());
    }

    #[test]
    fn test_runnable_steps_respect_dependencies() {
        let definition = diamond();
        let mut instance = instance();

        let runnable: Vec<&str> = instance
            .runnable_steps(&definition)
            .iter()
            .map(|step| step.id.as_str())
            .collect();
        assert_eq!(runnable, vec!["a", "b"]);

        instance.mark_step_completed("a", None);
        let runnable: Vec<&str> = instance
            .runnable_steps(&definition)
            .iter()
            .map(|step| step.id.as_str())
            .collect();
        assert_eq!(runnable, vec!["b"]);

        instance.mark_step_completed("b", None);
        let runnable: Vec<&str> = instance
            .runnable_steps(&definition)
            .iter()
            .map(|step| step.id.as_str())
            .collect();
        assert_eq!(runnable, vec!["c"]);
    }

    #[test]
    fn test_runnable_steps_skip_active_and_failed() {
        let definition = diamond();
        let mut instance = instance();

        instance.mark_step_active("a");
        instance.mark_step_failed("b");

        let runnable: Vec<&str> = instance
            .runnable_steps(&definition)
            .iter()
            .map(|step| step.id.as_str())
            .collect();
        assert!(runnable.is_empty());
    }

    #[test]
    fn test_object_outputs_merge_key_by_key() {
        let mut instance = instance();
        instance.merge_context("reserve", json!({"reservation_id": "RES-0001"}));
        instance.merge_context("charge", json!({"payment_id": "PAY-0001"}));

        assert_eq!(instance.context["reservation_id"], json!("RES-0001"));
        assert_eq!(instance.context["payment_id"], json!("PAY-0001"));
    }

    #[test]
    fn test_scalar_outputs_stored_under_step_id() {
        let mut instance = instance();
        instance.mark_step_completed("count-items", Some(json!(3)));

        assert_eq!(instance.context["count-items"], json!(3));
        assert!(instance.completed_steps.contains("count-items"));
        assert!(!instance.active_steps.contains("count-items"));
    }

    #[test]
    fn test_all_steps_completed() {
        let definition = diamond();
        let mut instance = instance();
        assert!(!instance.all_steps_completed(&definition));

        for id in ["a", "b", "c"] {
            instance.mark_step_completed(id, None);
        }
        assert!(instance.all_steps_completed(&definition));
    }

    #[test]
    fn test_instance_serialization_roundtrip() {
        let mut instance = instance();
        instance.status = SagaStatus::Running;
        instance.mark_step_active("a");
        instance.mark_step_completed("a", Some(json!({"ok": true})));
        instance.error = Some(SagaErrorInfo {
            message: "boom".to_string(),
            step_id: Some("b".to_string()),
            timestamp: Utc::now(),
            retry_count: 2,
        });

        let json = serde_json::to_string(&instance).unwrap();
        let back: SagaInstance = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, instance.id);
        assert_eq!(back.status, SagaStatus::Running);
        assert!(back.completed_steps.contains("a"));
        assert_eq!(back.context["ok"], json!(true));
        assert_eq!(back.error.unwrap().retry_count, 2);
    }
}
