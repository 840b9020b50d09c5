//! Failure-handling building blocks for the saga engine.
//!
//! Two independent layers live here:
//! - [`RetryPolicy`] retries transient failures with configurable backoff
//!   and error classification.
//! - [`CircuitBreaker`] fast-fails calls to a degraded dependency after a
//!   failure-rate or slow-call-rate threshold is crossed, periodically
//!   probing recovery.
//!
//! Both are consulted by the orchestrator around every step execution but
//! carry no saga-specific knowledge of their own.

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitState,
};
pub use retry::{RetryClass, RetryError, RetryOptions, RetryPolicy, RetryStats};
