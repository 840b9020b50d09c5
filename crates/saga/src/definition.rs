//! Saga definitions: commands, steps, and structural validation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use resilience::RetryOptions;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// An instruction dispatched when a step runs or is compensated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCommand {
    /// Dispatch key; a handler must be registered under this name.
    pub command_type: String,
    /// Free-form payload passed to the handler.
    pub data: serde_json::Value,
    /// When set, the command is published to this topic for an external
    /// executor instead of running a local handler. The step then
    /// settles through `complete_external_step`.
    pub target_topic: Option<String>,
}

impl SagaCommand {
    pub fn new(command_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            command_type: command_type.into(),
            data,
            target_topic: None,
        }
    }

    /// Routes the command to an external executor via the given topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.target_topic = Some(topic.into());
        self
    }
}

/// One unit of work within a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    /// Step ID, unique within its definition.
    pub id: String,
    /// Command executed when the step runs.
    pub command: SagaCommand,
    /// Command that undoes the step during compensation. Steps without
    /// one are irreversible and are skipped by the compensation walk.
    pub compensation: Option<SagaCommand>,
    /// Retry options for this step; the orchestrator default applies
    /// when unset.
    pub retry: Option<RetryOptions>,
    /// Per-attempt timeout; the orchestrator default applies when
    /// unset.
    pub timeout: Option<Duration>,
    /// Steps that must complete before this one is scheduled.
    pub depends_on: Vec<String>,
}

impl SagaStep {
    pub fn new(id: impl Into<String>, command: SagaCommand) -> Self {
        Self {
            id: id.into(),
            command,
            compensation: None,
            retry: None,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_compensation(mut self, command: SagaCommand) -> Self {
        self.compensation = Some(command);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a dependency on another step of the same definition.
    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }
}

/// A named set of steps forming a dependency graph.
///
/// Steps are kept in declaration order; the compensation walk visits
/// completed steps in reverse declaration order, not reverse completion
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaDefinition {
    /// Definition ID used when starting instances.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Steps in declaration order.
    pub steps: Vec<SagaStep>,
    /// Deadline for a whole instance, measured from its start.
    pub timeout: Option<Duration>,
}

impl SagaDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            timeout: None,
        }
    }

    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn find_step(&self, step_id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Checks the structural invariants of the definition: a non-empty
    /// step list, unique non-empty step IDs, dependencies that refer to
    /// declared steps, and an acyclic dependency graph.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SagaError::InvalidDefinition(
                "definition id must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "definition '{}' has no steps",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "definition '{}' contains a step with an empty id",
                    self.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dependency in &step.depends_on {
                if !ids.contains(dependency.as_str()) {
                    return Err(SagaError::InvalidDefinition(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dependency
                    )));
                }
            }
        }

        self.check_for_cycles()
    }

    /// Kahn's algorithm over the dependency graph; any step left with a
    /// positive in-degree sits on a cycle.
    fn check_for_cycles(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|step| (step.id.as_str(), step.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dependency in &step.depends_on {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut resolved = 0usize;
        while let Some(id) = ready.pop() {
            resolved += 1;
            if let Some(children) = dependents.get(id) {
                for &child in children {
                    if let Some(degree) = indegree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(child);
                        }
                    }
                }
            }
        }

        if resolved < self.steps.len() {
            let mut cycle: Vec<&str> = indegree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            cycle.sort_unstable();
            return Err(SagaError::InvalidDefinition(format!(
                "dependency cycle involving steps: {}",
                cycle.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str) -> SagaStep {
        SagaStep::new(id, SagaCommand::new(format!("{id}-command"), json!({})))
    }

    #[test]
    fn test_builder_assembles_definition() {
        let definition = SagaDefinition::new("order-fulfillment", "Order Fulfillment")
            .step(
                step("reserve-inventory")
                    .with_compensation(SagaCommand::new("release-inventory", json!({})))
                    .with_retry(RetryOptions::exponential())
                    .with_timeout(Duration::from_secs(5)),
            )
            .step(step("charge-payment").with_dependency("reserve-inventory"))
            .with_timeout(Duration::from_secs(60));

        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.timeout, Some(Duration::from_secs(60)));

        let reserve = definition.find_step("reserve-inventory").unwrap();
        assert!(reserve.compensation.is_some());
        assert_eq!(reserve.timeout, Some(Duration::from_secs(5)));

        let charge = definition.find_step("charge-payment").unwrap();
        assert_eq!(charge.depends_on, vec!["reserve-inventory"]);
    }

    #[test]
    fn test_validate_accepts_dag() {
        let definition = SagaDefinition::new("diamond", "Diamond")
            .step(step("a"))
            .step(step("b").with_dependency("a"))
            .step(step("c").with_dependency("a"))
            .step(step("d").with_dependency("b").with_dependency("c"));

        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_steps() {
        let definition = SagaDefinition::new("empty", "Empty");
        let error = definition.validate().unwrap_err();
        assert!(matches!(error, SagaError::InvalidDefinition(_)));
    }

    #[test]
    fn test_validate_rejects_duplicate_step_ids() {
        let definition = SagaDefinition::new("dupes", "Dupes")
            .step(step("a"))
            .step(step("a"));

        let error = definition.validate().unwrap_err();
        assert!(error.to_string().contains("duplicate step id 'a'"));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let definition = SagaDefinition::new("dangling", "Dangling")
            .step(step("ship-order").with_dependency("charge-payment"));

        let error = definition.validate().unwrap_err();
        assert!(matches!(error, SagaError::InvalidDefinition(_)));
        assert!(
            error
                .to_string()
                .contains("depends on unknown step 'charge-payment'")
        );
    }

    #[test]
    fn test_validate_rejects_dependency_cycles() {
        let definition = SagaDefinition::new("cyclic", "Cyclic")
            .step(step("a").with_dependency("c"))
            .step(step("b").with_dependency("a"))
            .step(step("c").with_dependency("b"));

        let error = definition.validate().unwrap_err();
        assert!(error.to_string().contains("dependency cycle"));
        assert!(error.to_string().contains("a, b, c"));
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let definition = SagaDefinition::new("selfish", "Selfish")
            .step(step("a").with_dependency("a"));

        let error = definition.validate().unwrap_err();
        assert!(error.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_definition_serialization_roundtrip() {
        let definition = SagaDefinition::new("order", "Order")
            .step(
                step("reserve")
                    .with_retry(RetryOptions::fixed())
                    .with_compensation(SagaCommand::new("release", json!({"all": true}))),
            )
            .step(step("charge").with_dependency("reserve"))
            .with_timeout(Duration::from_millis(1500));

        let json = serde_json::to_string(&definition).unwrap();
        let back: SagaDefinition = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, "order");
        assert_eq!(back.steps.len(), 2);
        assert_eq!(back.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(back.steps[1].depends_on, vec!["reserve"]);
        assert!(back.validate().is_ok());
    }
}
