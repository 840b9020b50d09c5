//! Saga orchestration over a message bus.
//!
//! This crate coordinates multi-step distributed transactions with
//! compensating actions on failure. A [`SagaDefinition`] declares the
//! steps and their dependencies; the [`SagaOrchestrator`] runs every
//! step whose dependencies are satisfied (in parallel within one
//! instance), wraps executions in retries and circuit breakers, and
//! publishes lifecycle events.
//!
//! If any step fails permanently, previously completed steps are
//! compensated in reverse declaration order.

pub mod clock;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod handler;
pub mod instance;
pub mod listener;
pub mod orchestrator;
pub mod status;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use definition::{SagaCommand, SagaDefinition, SagaStep};
pub use error::{Result, SagaError};
pub use events::{SagaEvent, SagaEventKind};
pub use handler::{StepHandler, StepOutcome};
pub use instance::{SagaContext, SagaErrorInfo, SagaInstance};
pub use listener::{ChannelListener, ListenerResult, LoggingListener, SagaListener};
pub use orchestrator::SagaOrchestrator;
pub use status::SagaStatus;
pub use store::{InMemoryInstanceStore, InstanceStore};
