//! Retry policy with exponential backoff, jitter, and error classification.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error for retry decisions.
///
/// The class name is matched against [`RetryOptions`] allow/deny lists;
/// the hint lets the error's producer veto retrying outright (e.g., a
/// handler that reported `retryable: false`).
pub trait RetryClass {
    /// Short class name matched against the configured class lists.
    fn class(&self) -> &str;

    /// Producer-supplied hint about whether retrying can help.
    fn retryable_hint(&self) -> Option<bool> {
        None
    }
}

/// Configuration for a [`RetryPolicy`].
///
/// Delay before retry *i* (0-based) is
/// `min(base_delay * backoff_multiplier^i, max_delay)`, scaled by a
/// uniform factor in `[0.5, 1.0]` when `jitter` is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Maximum number of retries; the operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay for each subsequent retry.
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform random factor in `[0.5, 1.0]`.
    pub jitter: bool,
    /// Allow-list of error classes; when non-empty, anything else is
    /// not retried.
    pub retryable_classes: Vec<String>,
    /// Deny-list of error classes, checked first and taking precedence.
    pub non_retryable_classes: Vec<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_classes: Vec::new(),
            non_retryable_classes: Vec::new(),
        }
    }
}

// Presets. All of them configure the same delay engine; none switch to a
// different algorithm.
impl RetryOptions {
    /// Retries immediately with no delay between attempts.
    pub fn immediate() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
            ..Self::default()
        }
    }

    /// Fixed one-second delay between attempts.
    pub fn fixed() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 1.0,
            jitter: false,
            ..Self::default()
        }
    }

    /// Jittered exponential backoff, doubling each retry.
    pub fn exponential() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter: true,
            ..Self::default()
        }
    }

    /// Gently growing delays (×1.5 per retry).
    pub fn linear() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            jitter: false,
            ..Self::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Network failures: retry only timeout/connection classes.
    pub fn network() -> Self {
        Self::exponential()
            .retryable("timeout")
            .retryable("connection")
            .retryable("unavailable")
    }

    /// Bus producer failures: quick retries, but malformed or oversized
    /// messages and authorization failures never recover on their own.
    pub fn bus_producer() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: true,
            ..Self::default()
        }
        .non_retryable("serialization")
        .non_retryable("message_too_large")
        .non_retryable("authorization")
    }

    /// Bus consumer failures: patient retries; undecodable payloads are
    /// terminal.
    pub fn bus_consumer() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Self::default()
        }
        .non_retryable("deserialization")
    }
}

// Builder-style setters.
impl RetryOptions {
    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the upper bound on any single delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the per-retry delay multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Adds an error class to the allow-list.
    pub fn retryable(mut self, class: impl Into<String>) -> Self {
        self.retryable_classes.push(class.into());
        self
    }

    /// Adds an error class to the deny-list.
    pub fn non_retryable(mut self, class: impl Into<String>) -> Self {
        self.non_retryable_classes.push(class.into());
        self
    }

    /// Computes the delay before retry `retry_index` (0-based).
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.powi(retry_index as i32);
        let mut millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        if millis > cap {
            millis = cap;
        }
        if self.jitter {
            millis *= 0.5 + rand::random::<f64>() * 0.5;
        }
        Duration::from_millis(millis as u64)
    }

    /// Decides whether `error` is eligible for another attempt.
    ///
    /// Order: deny-list, allow-list, producer hint, then the caller's
    /// predicate. All gates must pass.
    fn should_retry<E, P>(&self, error: &E, retry_condition: &P) -> bool
    where
        E: RetryClass,
        P: Fn(&E) -> bool,
    {
        let class = error.class();
        if self.non_retryable_classes.iter().any(|c| c == class) {
            return false;
        }
        if !self.retryable_classes.is_empty() && !self.retryable_classes.iter().any(|c| c == class)
        {
            return false;
        }
        if error.retryable_hint() == Some(false) {
            return false;
        }
        retry_condition(error)
    }
}

/// Error returned when a retried operation does not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every permitted attempt failed.
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The error was classified as non-retryable. Retryable failures
    /// may still have preceded it; `attempts` counts them all.
    #[error("operation failed with non-retryable error: {error}")]
    Rejected { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// Returns the underlying error.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Rejected { error, .. } => error,
        }
    }

    /// Consumes the wrapper and returns the underlying error.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Rejected { error, .. } => error,
        }
    }

    /// Total number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    operations: u64,
    total_attempts: u64,
    successful_attempts: u64,
    failed_attempts: u64,
    total_retries: u64,
}

/// Point-in-time view of a policy's cumulative counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    /// Number of `execute` calls.
    pub operations: u64,
    /// Attempts across all operations.
    pub total_attempts: u64,
    /// Attempts that returned success.
    pub successful_attempts: u64,
    /// Attempts that returned an error.
    pub failed_attempts: u64,
    /// Attempts that were retries (everything after each first attempt).
    pub total_retries: u64,
    /// `total_attempts / operations`.
    pub average_attempts: f64,
    /// `successful_attempts / total_attempts`.
    pub success_rate: f64,
    /// `total_retries / total_attempts`.
    pub retry_rate: f64,
}

/// Executes async operations with retries, backoff, and classification.
///
/// Policies are cheap to clone; clones share the same cumulative counters.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    options: RetryOptions,
    counters: Arc<RwLock<RetryCounters>>,
}

impl RetryPolicy {
    /// Creates a policy from the given options.
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            counters: Arc::new(RwLock::new(RetryCounters::default())),
        }
    }

    /// Returns the configured options.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Runs `operation` up to `max_retries + 1` times, retrying anything
    /// the classification allows.
    ///
    /// The operation receives the 0-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        E: RetryClass,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_where(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute) with an additional per-call retry
    /// predicate, consulted after the class lists and producer hint.
    pub async fn execute_where<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        retry_condition: P,
    ) -> Result<T, RetryError<E>>
    where
        E: RetryClass,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.counters.write().unwrap().operations += 1;

        let mut attempt = 0u32;
        loop {
            self.counters.write().unwrap().total_attempts += 1;

            match operation(attempt).await {
                Ok(value) => {
                    self.counters.write().unwrap().successful_attempts += 1;
                    return Ok(value);
                }
                Err(err) => {
                    self.counters.write().unwrap().failed_attempts += 1;

                    if !self.options.should_retry(&err, &retry_condition) {
                        return Err(RetryError::Rejected {
                            attempts: attempt + 1,
                            error: err,
                        });
                    }
                    if attempt >= self.options.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }

                    let delay = self.options.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        class = err.class(),
                        "retrying after backoff"
                    );
                    self.counters.write().unwrap().total_retries += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Returns a snapshot of the cumulative counters.
    pub fn stats(&self) -> RetryStats {
        let counters = self.counters.read().unwrap();
        let average_attempts = if counters.operations > 0 {
            counters.total_attempts as f64 / counters.operations as f64
        } else {
            0.0
        };
        let success_rate = if counters.total_attempts > 0 {
            counters.successful_attempts as f64 / counters.total_attempts as f64
        } else {
            0.0
        };
        let retry_rate = if counters.total_attempts > 0 {
            counters.total_retries as f64 / counters.total_attempts as f64
        } else {
            0.0
        };
        RetryStats {
            operations: counters.operations,
            total_attempts: counters.total_attempts,
            successful_attempts: counters.successful_attempts,
            failed_attempts: counters.failed_attempts,
            total_retries: counters.total_retries,
            average_attempts,
            success_rate,
            retry_rate,
        }
    }

    /// Resets all cumulative counters to zero.
    pub fn reset_stats(&self) {
        *self.counters.write().unwrap() = RetryCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Debug)]
    struct TestError {
        class: &'static str,
        retryable: Option<bool>,
    }

    impl TestError {
        fn new(class: &'static str) -> Self {
            Self {
                class,
                retryable: None,
            }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{} error", self.class)
        }
    }

    impl RetryClass for TestError {
        fn class(&self) -> &str {
            self.class
        }

        fn retryable_hint(&self) -> Option<bool> {
            self.retryable
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let policy = RetryPolicy::new(RetryOptions::immediate());
        let result: Result<i32, RetryError<TestError>> =
            policy.execute(|_| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        let stats = policy.stats();
        assert_eq!(stats.operations, 1);
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.total_retries, 0);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let policy = RetryPolicy::new(RetryOptions::immediate().with_max_retries(2));
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = policy
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::new("timeout")) }
            })
            .await;

        // max_retries=2 means 3 attempts total
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let policy = RetryPolicy::new(RetryOptions::immediate());
        let attempts = AtomicU32::new(0);

        let result: Result<&str, RetryError<TestError>> = policy
            .execute(|_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::new("connection"))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(policy.stats().total_retries, 2);
    }

    #[tokio::test]
    async fn backoff_delays_grow_exponentially() {
        let options = RetryOptions::default()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);
        let policy = RetryPolicy::new(options);

        let started = Instant::now();
        let result: Result<(), RetryError<TestError>> = policy
            .execute(|_| async { Err(TestError::new("timeout")) })
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        // ~100ms before retry 1, ~200ms before retry 2
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[test]
    fn delay_formula_caps_at_max() {
        let options = RetryOptions::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(options.delay_for(0), Duration::from_millis(100));
        assert_eq!(options.delay_for(1), Duration::from_millis(200));
        assert_eq!(options.delay_for(2), Duration::from_millis(250));
        assert_eq!(options.delay_for(10), Duration::from_millis(250));
    }

    #[test]
    fn jitter_scales_within_bounds() {
        let options = RetryOptions::default()
            .with_base_delay(Duration::from_millis(1000))
            .with_backoff_multiplier(1.0)
            .with_jitter(true);

        for _ in 0..100 {
            let delay = options.delay_for(0);
            assert!(delay >= Duration::from_millis(500), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(1000), "delay {delay:?}");
        }
    }

    #[tokio::test]
    async fn non_retryable_class_takes_precedence() {
        let options = RetryOptions::immediate()
            .retryable("serialization")
            .non_retryable("serialization");
        let policy = RetryPolicy::new(options);
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = policy
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::new("serialization")) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Rejected { .. })));
    }

    #[tokio::test]
    async fn allow_list_rejects_other_classes() {
        let options = RetryOptions::immediate().retryable("timeout");
        let policy = RetryPolicy::new(options);
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = policy
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::new("authorization")) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Rejected { .. })));
    }

    #[tokio::test]
    async fn producer_hint_stops_retrying() {
        let policy = RetryPolicy::new(RetryOptions::immediate());
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = policy
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TestError {
                        class: "handler",
                        retryable: Some(false),
                    })
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Rejected { .. })));
    }

    #[tokio::test]
    async fn custom_condition_consulted_last() {
        let policy = RetryPolicy::new(RetryOptions::immediate());
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = policy
            .execute_where(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::new("timeout")) }
                },
                |err: &TestError| err.class != "timeout",
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Rejected { .. })));
    }

    #[tokio::test]
    async fn stats_reset() {
        let policy = RetryPolicy::new(RetryOptions::immediate());
        let _: Result<i32, RetryError<TestError>> = policy.execute(|_| async { Ok(1) }).await;

        assert_eq!(policy.stats().operations, 1);
        policy.reset_stats();
        let stats = policy.stats();
        assert_eq!(stats.operations, 0);
        assert_eq!(stats.total_attempts, 0);
        assert_eq!(stats.average_attempts, 0.0);
    }

    #[test]
    fn presets_configure_options_only() {
        assert_eq!(RetryOptions::no_retry().max_retries, 0);
        assert_eq!(RetryOptions::immediate().base_delay, Duration::ZERO);
        assert_eq!(RetryOptions::fixed().backoff_multiplier, 1.0);
        assert_eq!(RetryOptions::exponential().backoff_multiplier, 2.0);
        assert!(RetryOptions::exponential().jitter);
        assert_eq!(RetryOptions::linear().backoff_multiplier, 1.5);

        let network = RetryOptions::network();
        assert!(network.retryable_classes.contains(&"timeout".to_string()));

        let producer = RetryOptions::bus_producer();
        assert!(
            producer
                .non_retryable_classes
                .contains(&"serialization".to_string())
        );

        let consumer = RetryOptions::bus_consumer();
        assert_eq!(consumer.max_retries, 10);
        assert!(
            consumer
                .non_retryable_classes
                .contains(&"deserialization".to_string())
        );
    }

    #[test]
    fn retry_error_accessors() {
        let err: RetryError<TestError> = RetryError::Exhausted {
            attempts: 4,
            last: TestError::new("timeout"),
        };
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.last_error().class, "timeout");
        assert_eq!(err.into_inner().class, "timeout");

        let err: RetryError<TestError> = RetryError::Rejected {
            attempts: 2,
            error: TestError::new("authorization"),
        };
        assert_eq!(err.attempts(), 2);
        assert_eq!(err.last_error().class, "authorization");
    }

    #[tokio::test]
    async fn rejection_after_transient_failures_counts_every_attempt() {
        let policy = RetryPolicy::new(RetryOptions::immediate());
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = policy
            .execute(|_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError::new("connection"))
                    } else {
                        Err(TestError {
                            class: "handler",
                            retryable: Some(false),
                        })
                    }
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let err = result.unwrap_err();
        assert!(matches!(&err, RetryError::Rejected { attempts: 2, .. }));
        assert_eq!(err.attempts(), 2);
        assert_eq!(policy.stats().total_retries, 1);
    }
}
