//! Step handler port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::definition::SagaCommand;
use crate::instance::SagaContext;

fn default_retryable() -> bool {
    true
}

/// Result of executing a step or compensation command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Whether the command did what it was asked.
    pub success: bool,
    /// Output merged into the saga context on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether a failure is worth retrying. Defaults to true.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            retryable: true,
        }
    }

    pub fn ok_with(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok()
        }
    }

    /// A retryable failure.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            retryable: true,
        }
    }

    /// A failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::err(message).with_retryable(false)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Executes one command on behalf of the orchestrator.
///
/// Handlers are registered per command type and receive a snapshot of
/// the instance context alongside the command. They report failure
/// through the returned [`StepOutcome`] rather than panicking.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, command: SagaCommand, context: SagaContext) -> StepOutcome;
}

/// Lets plain async closures act as step handlers.
#[async_trait]
impl<F, Fut> StepHandler for F
where
    F: Fn(SagaCommand, SagaContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = StepOutcome> + Send,
{
    async fn handle(&self, command: SagaCommand, context: SagaContext) -> StepOutcome {
        self(command, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_outcome_constructors() {
        let ok = StepOutcome::ok_with(json!({"reservation_id": "RES-0001"}));
        assert!(ok.success);
        assert_eq!(ok.data, Some(json!({"reservation_id": "RES-0001"})));

        let err = StepOutcome::err("temporarily unavailable");
        assert!(!err.success);
        assert!(err.retryable);

        let fatal = StepOutcome::fatal("card declined");
        assert!(!fatal.success);
        assert!(!fatal.retryable);
        assert_eq!(fatal.error.as_deref(), Some("card declined"));
    }

    #[test]
    fn test_retryable_defaults_to_true_on_the_wire() {
        let outcome: StepOutcome =
            serde_json::from_str("{\"success\":false,\"error\":\"boom\"}").unwrap();
        assert!(outcome.retryable);
    }

    #[tokio::test]
    async fn test_closure_acts_as_step_handler() {
        let handler: Arc<dyn StepHandler> =
            Arc::new(|command: SagaCommand, context: SagaContext| async move {
                assert_eq!(command.command_type, "echo");
                StepOutcome::ok_with(json!({
                    "echoed": command.data,
                    "context_keys": context.len(),
                }))
            });

        let mut context = SagaContext::new();
        context.insert("order_id".to_string(), json!("ORD-1"));

        let outcome = handler
            .handle(SagaCommand::new("echo", json!("ping")), context)
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.data.unwrap()["context_keys"], json!(1));
    }
}
