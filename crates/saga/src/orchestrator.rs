//! The saga orchestration engine.
//!
//! [`SagaOrchestrator`] coordinates saga instances end to end: it
//! validates and registers definitions, schedules every step whose
//! dependencies are satisfied (in parallel within one instance), wraps
//! each execution in a retry policy and a per-command-type circuit
//! breaker, publishes lifecycle events, and unwinds completed steps
//! with compensating commands when an instance fails, is cancelled, or
//! times out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{RwLock, mpsc};

use bus::{BusMessage, BusProducer, DeadLetterQueue};
use common::SagaId;
use resilience::{CircuitBreakerRegistry, RetryClass, RetryPolicy};
use telemetry::MetricsCollector;

use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::definition::{SagaDefinition, SagaStep};
use crate::error::{Result, SagaError};
use crate::events::{SagaEvent, SagaEventKind};
use crate::handler::{StepHandler, StepOutcome};
use crate::instance::{SagaContext, SagaErrorInfo, SagaInstance};
use crate::listener::{ChannelListener, SagaListener};
use crate::status::SagaStatus;
use crate::store::{InMemoryInstanceStore, InstanceStore};

/// Terminal description of one failed step attempt, classified for
/// retry decisions.
#[derive(Debug)]
struct StepFailure {
    class: &'static str,
    message: String,
    retryable: bool,
}

impl StepFailure {
    fn from_outcome(outcome: StepOutcome) -> Self {
        Self {
            class: "handler",
            message: outcome
                .error
                .unwrap_or_else(|| "step handler reported failure".to_string()),
            retryable: outcome.retryable,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self {
            class: "timeout",
            message: format!("step timed out after {after:?}"),
            retryable: true,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl RetryClass for StepFailure {
    fn class(&self) -> &str {
        self.class
    }

    fn retryable_hint(&self) -> Option<bool> {
        if self.retryable { None } else { Some(false) }
    }
}

/// How one scheduled step left the current scheduling pass.
enum StepResolution {
    Completed {
        step_id: String,
        output: Option<serde_json::Value>,
    },
    Failed {
        step_id: String,
        error: String,
        retries: u32,
    },
    /// Dispatched to an external executor; settles later through
    /// `complete_external_step`.
    AwaitingExternal,
}

/// What one scheduling pass decided for an instance.
enum PassDecision {
    /// Instance gone or no longer schedulable.
    Halt,
    /// Every step has completed.
    Complete,
    /// Nothing runnable; in-flight or external steps remain.
    Park,
    /// Steps marked active in this pass, ready to dispatch.
    Dispatch(Vec<SagaStep>),
}

/// Coordinates saga instances over a message bus.
///
/// Generic over the bus producer, the instance store, and the clock so
/// tests can run fully in memory with deterministic time.
pub struct SagaOrchestrator<P, S, C>
where
    P: BusProducer + Clone,
    S: InstanceStore + Clone,
    C: Clock + Clone,
{
    config: OrchestratorConfig,
    producer: P,
    store: S,
    clock: C,
    dead_letters: DeadLetterQueue<P>,
    definitions: Arc<RwLock<HashMap<String, Arc<SagaDefinition>>>>,
    step_handlers: Arc<RwLock<HashMap<String, Arc<dyn StepHandler>>>>,
    compensation_handlers: Arc<RwLock<HashMap<String, Arc<dyn StepHandler>>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn SagaListener>>>>,
    breakers: CircuitBreakerRegistry,
    metrics: MetricsCollector,
}

impl<P, S, C> Clone for SagaOrchestrator<P, S, C>
where
    P: BusProducer + Clone,
    S: InstanceStore + Clone,
    C: Clock + Clone,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            producer: self.producer.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            dead_letters: self.dead_letters.clone(),
            definitions: Arc::clone(&self.definitions),
            step_handlers: Arc::clone(&self.step_handlers),
            compensation_handlers: Arc::clone(&self.compensation_handlers),
            listeners: Arc::clone(&self.listeners),
            breakers: self.breakers.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl SagaOrchestrator<bus::InMemoryBus, InMemoryInstanceStore, SystemClock> {
    /// Creates an orchestrator wired entirely to in-memory
    /// infrastructure and the system clock.
    pub fn in_memory(config: OrchestratorConfig) -> Self {
        Self::new(
            config,
            bus::InMemoryBus::new(),
            InMemoryInstanceStore::new(),
            SystemClock,
        )
    }
}

impl<P, S, C> SagaOrchestrator<P, S, C>
where
    P: BusProducer + Clone + 'static,
    S: InstanceStore + Clone + 'static,
    C: Clock + Clone + 'static,
{
    pub fn new(config: OrchestratorConfig, producer: P, store: S, clock: C) -> Self {
        let dead_letters = DeadLetterQueue::new(producer.clone(), config.dead_letter_topic.clone());
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone());
        Self {
            config,
            producer,
            store,
            clock,
            dead_letters,
            definitions: Arc::new(RwLock::new(HashMap::new())),
            step_handlers: Arc::new(RwLock::new(HashMap::new())),
            compensation_handlers: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            breakers,
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the default metrics collector, e.g. with one shared by
    /// the whole process.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Circuit breakers keyed by step command type.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Validates and registers a saga definition. Re-registering an ID
    /// replaces the previous definition for new instances.
    pub async fn register_saga(&self, definition: SagaDefinition) -> Result<()> {
        definition.validate()?;
        tracing::info!(
            definition = %definition.id,
            steps = definition.steps.len(),
            "saga definition registered"
        );
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Registers the handler that executes steps of `command_type`.
    pub async fn register_step_handler(
        &self,
        command_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) {
        self.step_handlers
            .write()
            .await
            .insert(command_type.into(), handler);
    }

    /// Registers the handler that undoes steps whose compensating
    /// command is of `command_type`.
    pub async fn register_compensation_handler(
        &self,
        command_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) {
        self.compensation_handlers
            .write()
            .await
            .insert(command_type.into(), handler);
    }

    /// Registers an async closure as a step handler.
    pub async fn register_step_fn<F, Fut>(&self, command_type: impl Into<String>, handler: F)
    where
        F: Fn(crate::definition::SagaCommand, SagaContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepOutcome> + Send + 'static,
    {
        self.register_step_handler(command_type, Arc::new(handler))
            .await;
    }

    /// Registers an async closure as a compensation handler.
    pub async fn register_compensation_fn<F, Fut>(
        &self,
        command_type: impl Into<String>,
        handler: F,
    ) where
        F: Fn(crate::definition::SagaCommand, SagaContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepOutcome> + Send + 'static,
    {
        self.register_compensation_handler(command_type, Arc::new(handler))
            .await;
    }

    /// Subscribes a listener to lifecycle events of every instance.
    pub async fn register_listener(&self, listener: Arc<dyn SagaListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Channel-based convenience over [`register_listener`]: returns a
    /// receiver that yields every lifecycle event from now on.
    ///
    /// [`register_listener`]: Self::register_listener
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SagaEvent> {
        let (listener, receiver) = ChannelListener::new();
        self.register_listener(Arc::new(listener)).await;
        receiver
    }

    /// Starts a new instance of a registered definition and returns its
    /// generated ID. Execution continues on a background task.
    pub async fn start_saga(
        &self,
        definition_id: &str,
        input: serde_json::Value,
    ) -> Result<SagaId> {
        self.start_saga_with_id(SagaId::new(), definition_id, input)
            .await
    }

    /// Starts a new instance under a caller-chosen ID.
    ///
    /// The initial input is merged into the instance context: objects
    /// key by key, anything else under `"input"`.
    #[tracing::instrument(skip(self, input))]
    pub async fn start_saga_with_id(
        &self,
        saga_id: SagaId,
        definition_id: &str,
        input: serde_json::Value,
    ) -> Result<SagaId> {
        let definition = self.definition(definition_id).await?;

        for step in &definition.steps {
            if step.command.target_topic.is_none()
                && !self
                    .step_handlers
                    .read()
                    .await
                    .contains_key(&step.command.command_type)
            {
                return Err(SagaError::UnknownCommandType(
                    step.command.command_type.clone(),
                ));
            }
        }

        let mut instance = SagaInstance::new(saga_id, definition_id, self.clock.now());
        if !input.is_null() {
            instance.merge_context("input", input);
        }

        if !self.store.insert(instance).await {
            return Err(SagaError::DuplicateInstance(saga_id));
        }

        metrics::counter!("saga_executions_total").increment(1);
        self.metrics.increment_counter_labeled(
            "saga_started_total",
            &[("definition", definition_id)],
            1,
        );
        self.metrics
            .adjust_gauge_labeled("active_sagas", &[("definition", definition_id)], 1.0);
        self.emit(SagaEvent::saga_started(saga_id, definition_id))
            .await;

        self.update_if(saga_id, |instance| {
            if instance.status == SagaStatus::Created {
                instance.status = SagaStatus::Running;
                true
            } else {
                false
            }
        })
        .await;

        tracing::info!(%saga_id, definition = %definition_id, "saga started");

        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(saga_id, definition).await;
        });

        Ok(saga_id)
    }

    /// Cancels a non-terminal instance, forcing compensation of its
    /// completed steps. In-flight steps finish naturally; their
    /// settlements are ignored.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_saga(&self, saga_id: SagaId) -> Result<()> {
        let instance = self
            .store
            .get(saga_id)
            .await
            .ok_or(SagaError::UnknownInstance(saga_id))?;
        if instance.status.is_terminal() {
            return Err(SagaError::InvalidState {
                expected: "a non-terminal status".to_string(),
                actual: instance.status,
            });
        }
        let definition = self.definition(&instance.definition_id).await?;

        let cancelled = self
            .update_if(saga_id, |instance| {
                if instance.status.can_compensate() {
                    instance.status = SagaStatus::Compensating;
                    true
                } else {
                    false
                }
            })
            .await;
        if cancelled.is_none() {
            // Already compensating; nothing to force.
            return Ok(());
        }

        self.metrics.increment_counter_labeled(
            "saga_cancelled_total",
            &[("definition", definition.id.as_str())],
            1,
        );
        self.emit(SagaEvent::saga_cancelled(saga_id, definition.id.as_str()))
            .await;
        tracing::info!(%saga_id, "saga cancelled");

        self.run_compensations(saga_id, &definition).await;
        Ok(())
    }

    /// Settles a step that was dispatched to an external executor, as
    /// if a local handler had returned `outcome`. Settlements for
    /// steps that are no longer active are ignored.
    #[tracing::instrument(skip(self, outcome))]
    pub async fn complete_external_step(
        &self,
        saga_id: SagaId,
        step_id: &str,
        outcome: StepOutcome,
    ) -> Result<()> {
        let instance = self
            .store
            .get(saga_id)
            .await
            .ok_or(SagaError::UnknownInstance(saga_id))?;
        let definition = self.definition(&instance.definition_id).await?;

        if instance.status != SagaStatus::Running || !instance.active_steps.contains(step_id) {
            tracing::debug!(
                %saga_id,
                step = %step_id,
                status = %instance.status,
                "ignoring settlement for inactive step"
            );
            return Ok(());
        }

        if outcome.success {
            self.settle_step_success(saga_id, &definition, step_id, outcome.data)
                .await;
            self.drive(saga_id, definition).await;
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "external step failed".to_string());
            self.quarantine_command(saga_id, &definition, step_id, &error)
                .await;
            self.fail_saga(saga_id, &definition, step_id, &error, 0).await;
        }
        Ok(())
    }

    /// Applies an inbound saga event produced by an external step
    /// executor: `step_completed` and `step_failed` events settle the
    /// named step, everything else is ignored.
    pub async fn handle_external_event(&self, event: &SagaEvent) -> Result<()> {
        let Some(step_id) = event.step_id.as_deref() else {
            return Ok(());
        };
        match event.kind {
            SagaEventKind::StepCompleted => {
                let outcome = match event.data.clone() {
                    Some(data) => StepOutcome::ok_with(data),
                    None => StepOutcome::ok(),
                };
                self.complete_external_step(event.saga_id, step_id, outcome)
                    .await
            }
            SagaEventKind::StepFailed => {
                let error = event
                    .error
                    .clone()
                    .unwrap_or_else(|| "external step failed".to_string());
                self.complete_external_step(event.saga_id, step_id, StepOutcome::fatal(error))
                    .await
            }
            _ => Ok(()),
        }
    }

    pub async fn get_saga_instance(&self, saga_id: SagaId) -> Option<SagaInstance> {
        self.store.get(saga_id).await
    }

    /// All instances, newest first.
    pub async fn get_all_saga_instances(&self) -> Vec<SagaInstance> {
        let mut instances = self.store.list().await;
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        instances
    }

    /// Instances currently in `status`, newest first.
    pub async fn get_saga_instances_by_status(&self, status: SagaStatus) -> Vec<SagaInstance> {
        let mut instances: Vec<SagaInstance> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|instance| instance.status == status)
            .collect();
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        instances
    }

    /// Evicts terminal instances that ended more than `older_than_hours`
    /// ago and returns how many were removed. A second sweep with no
    /// new completions removes nothing.
    pub async fn cleanup_completed_sagas(&self, older_than_hours: u64) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::hours(older_than_hours as i64);
        let mut removed = 0usize;
        for instance in self.store.list().await {
            if !instance.status.is_terminal() {
                continue;
            }
            let Some(ended_at) = instance.ended_at else {
                continue;
            };
            if ended_at <= cutoff && self.store.remove(instance.id).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, older_than_hours, "cleaned up finished sagas");
        }
        removed
    }

    /// Spawns the background watcher that periodically sweeps for
    /// expired instances. Abort the returned handle to stop it.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let interval = self.config.timeout_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.check_timeouts().await;
            }
        })
    }

    /// Sweeps every instance against its definition deadline and
    /// returns how many expired.
    ///
    /// A running instance that exceeds the deadline is treated as a
    /// synthetic failure and compensated; one already compensating is
    /// declared `timeout` and finalized. Public so schedulers and tests
    /// can trigger a sweep explicitly.
    pub async fn check_timeouts(&self) -> usize {
        let now = self.clock.now();
        let mut expired = 0usize;

        for instance in self.store.list().await {
            let Some(definition) = self
                .definitions
                .read()
                .await
                .get(&instance.definition_id)
                .cloned()
            else {
                continue;
            };
            let Some(timeout) = definition.timeout else {
                continue;
            };
            let Ok(deadline_span) = chrono::Duration::from_std(timeout) else {
                continue;
            };
            if now < instance.started_at + deadline_span {
                continue;
            }

            match instance.status {
                SagaStatus::Created | SagaStatus::Running => {
                    expired += 1;
                    self.expire_running(instance.id, &definition, timeout).await;
                }
                SagaStatus::Compensating => {
                    expired += 1;
                    self.expire_compensating(instance.id, &definition, now).await;
                }
                _ => {}
            }
        }

        expired
    }

    /// Runs one instance until it completes, fails over to
    /// compensation, or parks awaiting external settlements.
    async fn drive(&self, saga_id: SagaId, definition: Arc<SagaDefinition>) {
        loop {
            let runnable = match self.schedule_pass(saga_id, &definition).await {
                PassDecision::Halt => return,
                PassDecision::Complete => {
                    self.complete_saga(saga_id, &definition).await;
                    return;
                }
                // Parked: the remaining steps are waiting on external
                // settlements.
                PassDecision::Park => return,
                PassDecision::Dispatch(runnable) => runnable,
            };

            let resolutions = join_all(
                runnable
                    .iter()
                    .map(|step| self.run_step(saga_id, &definition, step)),
            )
            .await;

            let mut failed: Option<(String, String, u32)> = None;
            for resolution in resolutions {
                match resolution {
                    StepResolution::Completed { step_id, output } => {
                        self.settle_step_success(saga_id, &definition, &step_id, output)
                            .await;
                    }
                    StepResolution::AwaitingExternal => {}
                    StepResolution::Failed {
                        step_id,
                        error,
                        retries,
                    } => {
                        if let Some((first_failed, _, _)) = &failed {
                            tracing::warn!(
                                %saga_id,
                                step = %step_id,
                                error,
                                first_failed,
                                "additional step failure in the same pass"
                            );
                        } else {
                            failed = Some((step_id, error, retries));
                        }
                    }
                }
            }

            if let Some((step_id, error, retries)) = failed {
                self.fail_saga(saga_id, &definition, &step_id, &error, retries)
                    .await;
                return;
            }
        }
    }

    /// Picks the runnable steps and marks them active inside a single
    /// store update, so overlapping drives over the same instance never
    /// dispatch a step twice.
    async fn schedule_pass(
        &self,
        saga_id: SagaId,
        definition: &Arc<SagaDefinition>,
    ) -> PassDecision {
        let decision: Arc<Mutex<Option<PassDecision>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&decision);
        let definition = Arc::clone(definition);
        self.store
            .update(
                saga_id,
                Box::new(move |instance| {
                    if !instance.status.can_schedule() {
                        return;
                    }
                    if instance.all_steps_completed(&definition) {
                        *slot.lock().unwrap() = Some(PassDecision::Complete);
                        return;
                    }
                    let runnable: Vec<SagaStep> = instance
                        .runnable_steps(&definition)
                        .into_iter()
                        .cloned()
                        .collect();
                    if runnable.is_empty() {
                        *slot.lock().unwrap() = Some(PassDecision::Park);
                        return;
                    }
                    for step in &runnable {
                        instance.mark_step_active(&step.id);
                    }
                    *slot.lock().unwrap() = Some(PassDecision::Dispatch(runnable));
                }),
            )
            .await;
        let taken = decision.lock().unwrap().take();
        taken.unwrap_or(PassDecision::Halt)
    }

    /// Executes one step through its retry policy, circuit breaker, and
    /// per-attempt timeout.
    async fn run_step(
        &self,
        saga_id: SagaId,
        definition: &SagaDefinition,
        step: &SagaStep,
    ) -> StepResolution {
        self.emit(SagaEvent::step_started(
            saga_id,
            definition.id.as_str(),
            step.id.as_str(),
        ))
        .await;

        if step.command.target_topic.is_some() {
            return self.dispatch_remote(saga_id, step).await;
        }

        let Some(instance) = self.store.get(saga_id).await else {
            return StepResolution::Failed {
                step_id: step.id.clone(),
                error: "saga instance no longer exists".to_string(),
                retries: 0,
            };
        };
        let context = instance.context;

        let Some(handler) = self.step_handler(&step.command.command_type).await else {
            return StepResolution::Failed {
                step_id: step.id.clone(),
                error: format!(
                    "no step handler registered for command type '{}'",
                    step.command.command_type
                ),
                retries: 0,
            };
        };

        let retry = RetryPolicy::new(
            step.retry
                .clone()
                .unwrap_or_else(|| self.config.default_retry.clone()),
        );
        let step_timeout = step.timeout.unwrap_or(self.config.default_step_timeout);
        let breaker = self.breakers.get_or_create(step.command.command_type.as_str());
        let timer = self.metrics.start_timer_labeled(
            "step_duration_seconds",
            &[
                ("definition", definition.id.as_str()),
                ("step", step.id.as_str()),
            ],
        );

        let result = retry
            .execute(|_attempt| {
                let handler = Arc::clone(&handler);
                let command = step.command.clone();
                let context = context.clone();
                let breaker = Arc::clone(&breaker);
                async move {
                    breaker
                        .execute(|| async move {
                            match tokio::time::timeout(
                                step_timeout,
                                handler.handle(command, context),
                            )
                            .await
                            {
                                Ok(outcome) => {
                                    if outcome.success {
                                        Ok(outcome.data)
                                    } else {
                                        Err(StepFailure::from_outcome(outcome))
                                    }
                                }
                                Err(_) => Err(StepFailure::timed_out(step_timeout)),
                            }
                        })
                        .await
                }
            })
            .await;
        timer.stop();

        let retries = retry.stats().total_retries;
        if retries > 0 {
            self.metrics.increment_counter_labeled(
                "step_retries_total",
                &[
                    ("definition", definition.id.as_str()),
                    ("step", step.id.as_str()),
                ],
                retries,
            );
        }

        match result {
            Ok(output) => StepResolution::Completed {
                step_id: step.id.clone(),
                output,
            },
            Err(error) => StepResolution::Failed {
                step_id: step.id.clone(),
                error: error.last_error().to_string(),
                retries: error.attempts().saturating_sub(1),
            },
        }
    }

    /// Publishes a step command to its target topic; the step settles
    /// later through `complete_external_step`.
    async fn dispatch_remote(&self, saga_id: SagaId, step: &SagaStep) -> StepResolution {
        let Some(instance) = self.store.get(saga_id).await else {
            return StepResolution::Failed {
                step_id: step.id.clone(),
                error: "saga instance no longer exists".to_string(),
                retries: 0,
            };
        };

        let message = self.command_message(saga_id, step, &instance.context);
        match self.producer.publish(message).await {
            Ok(offset) => {
                tracing::debug!(
                    %saga_id,
                    step = %step.id,
                    topic = step.command.target_topic.as_deref(),
                    offset,
                    "remote step command dispatched"
                );
                StepResolution::AwaitingExternal
            }
            Err(error) => StepResolution::Failed {
                step_id: step.id.clone(),
                error: error.to_string(),
                retries: 0,
            },
        }
    }

    fn command_message(
        &self,
        saga_id: SagaId,
        step: &SagaStep,
        context: &SagaContext,
    ) -> BusMessage {
        let topic = step
            .command
            .target_topic
            .as_deref()
            .unwrap_or(self.config.commands_topic.as_str());
        BusMessage::builder(topic)
            .key(saga_id.to_string())
            .payload_raw(serde_json::json!({
                "sagaId": saga_id,
                "stepId": step.id,
                "command": step.command,
                "context": context,
            }))
            .header("saga-id", saga_id.to_string())
            .header("step-id", step.id.as_str())
            .build()
    }

    /// Records a successful step and unlocks its dependents. No-ops
    /// when the instance left `Running` or the step is no longer
    /// active, which happens when the saga was cancelled mid-flight.
    async fn settle_step_success(
        &self,
        saga_id: SagaId,
        definition: &SagaDefinition,
        step_id: &str,
        output: Option<serde_json::Value>,
    ) {
        let step_owned = step_id.to_string();
        let event_data = output.clone();
        let settled = self
            .update_if(saga_id, move |instance| {
                if instance.status == SagaStatus::Running
                    && instance.active_steps.contains(&step_owned)
                {
                    instance.mark_step_completed(&step_owned, output);
                    true
                } else {
                    false
                }
            })
            .await;
        if settled.is_none() {
            tracing::debug!(%saga_id, step = %step_id, "ignoring completion for inactive step");
            return;
        }

        self.emit(SagaEvent::step_completed(
            saga_id,
            definition.id.as_str(),
            step_id,
            event_data,
        ))
        .await;
        tracing::info!(%saga_id, step = %step_id, "saga step completed");
    }

    /// Finalizes a fully completed instance.
    async fn complete_saga(&self, saga_id: SagaId, definition: &SagaDefinition) {
        let ended = self.clock.now();
        let Some(completed) = self
            .update_if(saga_id, move |instance| {
                if instance.status == SagaStatus::Running {
                    instance.status = SagaStatus::Completed;
                    instance.ended_at = Some(ended);
                    true
                } else {
                    false
                }
            })
            .await
        else {
            return;
        };

        let duration = duration_seconds(completed.started_at, ended);
        metrics::histogram!("saga_duration_seconds").record(duration);
        metrics::counter!("saga_completed").increment(1);
        self.metrics.increment_counter_labeled(
            "saga_completed_total",
            &[("definition", definition.id.as_str())],
            1,
        );
        self.metrics.adjust_gauge_labeled(
            "active_sagas",
            &[("definition", definition.id.as_str())],
            -1.0,
        );
        self.metrics.observe_histogram_labeled(
            "saga_duration_seconds",
            &[("definition", definition.id.as_str())],
            duration,
        );
        self.emit(SagaEvent::saga_completed(saga_id, definition.id.as_str()))
            .await;
        tracing::info!(%saga_id, definition = %definition.id, duration, "saga completed");
    }

    /// Records a terminal step failure and enters the compensation
    /// path.
    async fn fail_saga(
        &self,
        saga_id: SagaId,
        definition: &SagaDefinition,
        step_id: &str,
        error: &str,
        retries: u32,
    ) {
        let info = SagaErrorInfo {
            message: error.to_string(),
            step_id: Some(step_id.to_string()),
            timestamp: self.clock.now(),
            retry_count: retries,
        };
        let step_owned = step_id.to_string();
        let failed = self
            .update_if(saga_id, move |instance| {
                if instance.status == SagaStatus::Running {
                    instance.mark_step_failed(&step_owned);
                    instance.error = Some(info);
                    instance.status = SagaStatus::Failed;
                    true
                } else {
                    false
                }
            })
            .await;
        if failed.is_none() {
            tracing::debug!(%saga_id, step = %step_id, "ignoring failure for inactive step");
            return;
        }

        self.metrics.increment_counter_labeled(
            "saga_failed_total",
            &[("definition", definition.id.as_str())],
            1,
        );
        self.emit(SagaEvent::step_failed(
            saga_id,
            definition.id.as_str(),
            step_id,
            error,
        ))
        .await;
        tracing::warn!(%saga_id, step = %step_id, error, "saga step failed permanently");

        self.compensate(saga_id, definition).await;
    }

    /// Transitions the instance into `Compensating` and runs the walk.
    async fn compensate(&self, saga_id: SagaId, definition: &SagaDefinition) {
        let transitioned = self
            .update_if(saga_id, |instance| {
                if instance.status.can_compensate() {
                    instance.status = SagaStatus::Compensating;
                    true
                } else {
                    false
                }
            })
            .await;
        if transitioned.is_none() {
            return;
        }
        self.run_compensations(saga_id, definition).await;
    }

    /// Undoes completed steps in reverse declaration order, then
    /// finalizes the instance as `Compensated` and emits `saga_failed`.
    ///
    /// The walk is best-effort: a failing compensating command is
    /// logged and the walk continues with the next step.
    async fn run_compensations(&self, saga_id: SagaId, definition: &SagaDefinition) {
        let Some(instance) = self.store.get(saga_id).await else {
            return;
        };

        self.emit(SagaEvent::compensation_started(
            saga_id,
            definition.id.as_str(),
        ))
        .await;

        let context = instance.context;
        for step in definition.steps.iter().rev() {
            if !instance.completed_steps.contains(&step.id) {
                continue;
            }
            if step.compensation.is_none() {
                tracing::debug!(
                    %saga_id,
                    step = %step.id,
                    "step has no compensating command, skipping"
                );
                continue;
            }

            match self.run_compensation(step, &context).await {
                Ok(()) => {
                    let step_owned = step.id.clone();
                    self.store
                        .update(
                            saga_id,
                            Box::new(move |instance| instance.mark_step_compensated(&step_owned)),
                        )
                        .await;
                    self.emit(SagaEvent::step_compensated(
                        saga_id,
                        definition.id.as_str(),
                        step.id.as_str(),
                    ))
                    .await;
                    tracing::info!(%saga_id, step = %step.id, "saga step compensated");
                }
                Err(message) => {
                    self.emit(SagaEvent::step_compensation_failed(
                        saga_id,
                        definition.id.as_str(),
                        step.id.as_str(),
                        message.as_str(),
                    ))
                    .await;
                    tracing::error!(
                        %saga_id,
                        step = %step.id,
                        error = %message,
                        "compensating command failed"
                    );
                }
            }
        }

        let ended = self.clock.now();
        let Some(compensated) = self
            .update_if(saga_id, move |instance| {
                if instance.status == SagaStatus::Compensating {
                    instance.status = SagaStatus::Compensated;
                    instance.ended_at = Some(ended);
                    true
                } else {
                    false
                }
            })
            .await
        else {
            return;
        };

        let reason = compensated
            .error
            .as_ref()
            .map(|error| error.message.clone())
            .unwrap_or_else(|| "saga cancelled".to_string());
        let duration = duration_seconds(compensated.started_at, ended);
        metrics::histogram!("saga_duration_seconds").record(duration);
        metrics::counter!("saga_failed").increment(1);
        self.metrics.increment_counter_labeled(
            "saga_compensated_total",
            &[("definition", definition.id.as_str())],
            1,
        );
        self.metrics.adjust_gauge_labeled(
            "active_sagas",
            &[("definition", definition.id.as_str())],
            -1.0,
        );
        self.metrics.observe_histogram_labeled(
            "saga_duration_seconds",
            &[("definition", definition.id.as_str())],
            duration,
        );
        self.emit(SagaEvent::saga_failed(
            saga_id,
            definition.id.as_str(),
            reason,
        ))
        .await;
        tracing::warn!(%saga_id, definition = %definition.id, "saga compensated");
    }

    /// Runs one compensating command with the per-step timeout.
    async fn run_compensation(
        &self,
        step: &SagaStep,
        context: &SagaContext,
    ) -> std::result::Result<(), String> {
        let Some(command) = step.compensation.clone() else {
            return Ok(());
        };

        let Some(handler) = self.compensation_handler(&command.command_type).await else {
            return Err(format!(
                "no compensation handler registered for command type '{}'",
                command.command_type
            ));
        };

        let step_timeout = step.timeout.unwrap_or(self.config.default_step_timeout);
        match tokio::time::timeout(step_timeout, handler.handle(command, context.clone())).await {
            Ok(outcome) if outcome.success => Ok(()),
            Ok(outcome) => Err(outcome
                .error
                .unwrap_or_else(|| "compensation handler reported failure".to_string())),
            Err(_) => Err(format!("compensation timed out after {step_timeout:?}")),
        }
    }

    /// Expires a running instance: records a synthetic failure and
    /// feeds the compensation path.
    async fn expire_running(
        &self,
        saga_id: SagaId,
        definition: &SagaDefinition,
        timeout: Duration,
    ) {
        let info = SagaErrorInfo {
            message: format!("saga timed out after {timeout:?}"),
            step_id: None,
            timestamp: self.clock.now(),
            retry_count: 0,
        };
        let expired = self
            .update_if(saga_id, move |instance| {
                if instance.status.can_compensate() && instance.error.is_none() {
                    instance.error = Some(info);
                    true
                } else {
                    false
                }
            })
            .await;
        if expired.is_none() {
            return;
        }

        self.metrics.increment_counter_labeled(
            "saga_timeout_total",
            &[("definition", definition.id.as_str())],
            1,
        );
        self.emit(SagaEvent::saga_timeout(saga_id, definition.id.as_str()))
            .await;
        tracing::warn!(%saga_id, definition = %definition.id, "saga exceeded its deadline");

        self.compensate(saga_id, definition).await;
    }

    /// Declares a stuck compensation timed out; the instance becomes
    /// terminal without further recovery.
    async fn expire_compensating(
        &self,
        saga_id: SagaId,
        definition: &SagaDefinition,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let stuck = self
            .update_if(saga_id, move |instance| {
                if instance.status == SagaStatus::Compensating {
                    instance.status = SagaStatus::TimedOut;
                    instance.ended_at = Some(now);
                    true
                } else {
                    false
                }
            })
            .await;
        if stuck.is_none() {
            return;
        }

        self.metrics.increment_counter_labeled(
            "saga_timeout_total",
            &[("definition", definition.id.as_str())],
            1,
        );
        self.metrics.adjust_gauge_labeled(
            "active_sagas",
            &[("definition", definition.id.as_str())],
            -1.0,
        );
        self.emit(SagaEvent::saga_timeout(saga_id, definition.id.as_str()))
            .await;
        tracing::error!(%saga_id, definition = %definition.id, "compensation timed out");
    }

    /// Publishes the original command of a permanently failed external
    /// step to the dead letter topic.
    async fn quarantine_command(
        &self,
        saga_id: SagaId,
        definition: &SagaDefinition,
        step_id: &str,
        error: &str,
    ) {
        let Some(step) = definition.find_step(step_id) else {
            return;
        };
        let Some(instance) = self.store.get(saga_id).await else {
            return;
        };
        let message = self.command_message(saga_id, step, &instance.context);
        if let Err(publish_error) = self.dead_letters.send(&message, error).await {
            tracing::error!(
                %saga_id,
                step = %step_id,
                error = %publish_error,
                "failed to dead-letter step command"
            );
        }
    }

    /// Publishes an event to the events topic and notifies listeners.
    /// Delivery problems are logged and never affect execution.
    async fn emit(&self, event: SagaEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                let mut builder = BusMessage::builder(self.config.events_topic.as_str())
                    .key(event.saga_id.to_string())
                    .payload_raw(payload)
                    .header("event-type", event.kind.as_str())
                    .header("saga-id", event.saga_id.to_string())
                    .header("saga-definition-id", event.definition_id.as_str());
                if let Some(step_id) = &event.step_id {
                    builder = builder.header("step-id", step_id.as_str());
                }
                if let Err(error) = self.producer.publish(builder.build()).await {
                    tracing::error!(%error, kind = %event.kind, "failed to publish saga event");
                }
            }
            Err(error) => {
                tracing::error!(%error, kind = %event.kind, "failed to serialize saga event");
            }
        }

        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(error) = listener.on_event(&event).await {
                tracing::error!(
                    %error,
                    listener = listener.name(),
                    kind = %event.kind,
                    "saga listener failed"
                );
            }
        }
    }

    /// Applies `mutate` under the store's per-instance lock; returns
    /// the updated instance only when `mutate` reported that it acted.
    async fn update_if<F>(&self, saga_id: SagaId, mutate: F) -> Option<SagaInstance>
    where
        F: FnOnce(&mut SagaInstance) -> bool + Send + 'static,
    {
        let applied = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&applied);
        let updated = self
            .store
            .update(
                saga_id,
                Box::new(move |instance| {
                    if mutate(instance) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await?;
        if applied.load(Ordering::SeqCst) {
            Some(updated)
        } else {
            None
        }
    }

    async fn definition(&self, definition_id: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .await
            .get(definition_id)
            .cloned()
            .ok_or_else(|| SagaError::UnknownDefinition(definition_id.to_string()))
    }

    async fn step_handler(&self, command_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.step_handlers.read().await.get(command_type).cloned()
    }

    async fn compensation_handler(&self, command_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.compensation_handlers
            .read()
            .await
            .get(command_type)
            .cloned()
    }
}

fn duration_seconds(
    started_at: chrono::DateTime<chrono::Utc>,
    ended_at: chrono::DateTime<chrono::Utc>,
) -> f64 {
    (ended_at - started_at).num_milliseconds() as f64 / 1000.0
}
