//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

use resilience::{CircuitBreakerConfig, RetryOptions};

/// Orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_EVENTS_TOPIC`: lifecycle event topic (default: `"saga-events"`)
/// - `SAGA_COMMANDS_TOPIC`: shared remote command topic (default: `"saga-commands"`)
/// - `SAGA_DLQ_TOPIC`: quarantine topic (default: `"saga-dlq"`)
/// - `SAGA_TIMEOUT_CHECK_INTERVAL_MS`: watcher sweep interval (default: 5000)
/// - `SAGA_DEFAULT_STEP_TIMEOUT_MS`: per-attempt step timeout (default: 30000)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Topic lifecycle events are published to.
    pub events_topic: String,
    /// Fallback topic for remote step commands that do not name their
    /// own target topic.
    pub commands_topic: String,
    /// Quarantine topic for commands that failed permanently.
    pub dead_letter_topic: String,
    /// How often the background watcher sweeps for expired instances.
    pub timeout_check_interval: Duration,
    /// Per-attempt timeout for steps that do not set their own.
    pub default_step_timeout: Duration,
    /// Retry options for steps that do not set their own.
    pub default_retry: RetryOptions,
    /// Circuit breaker settings shared by all command types.
    pub breaker: CircuitBreakerConfig,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            events_topic: std::env::var("SAGA_EVENTS_TOPIC").unwrap_or(defaults.events_topic),
            commands_topic: std::env::var("SAGA_COMMANDS_TOPIC")
                .unwrap_or(defaults.commands_topic),
            dead_letter_topic: std::env::var("SAGA_DLQ_TOPIC")
                .unwrap_or(defaults.dead_letter_topic),
            timeout_check_interval: std::env::var("SAGA_TIMEOUT_CHECK_INTERVAL_MS")
                .ok()
                .and_then(|millis| millis.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout_check_interval),
            default_step_timeout: std::env::var("SAGA_DEFAULT_STEP_TIMEOUT_MS")
                .ok()
                .and_then(|millis| millis.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_step_timeout),
            default_retry: defaults.default_retry,
            breaker: defaults.breaker,
        }
    }

    pub fn with_events_topic(mut self, topic: impl Into<String>) -> Self {
        self.events_topic = topic.into();
        self
    }

    pub fn with_commands_topic(mut self, topic: impl Into<String>) -> Self {
        self.commands_topic = topic.into();
        self
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = topic.into();
        self
    }

    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryOptions) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            events_topic: "saga-events".to_string(),
            commands_topic: "saga-commands".to_string(),
            dead_letter_topic: "saga-dlq".to_string(),
            timeout_check_interval: Duration::from_secs(5),
            default_step_timeout: Duration::from_secs(30),
            default_retry: RetryOptions::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}
