//! Circuit breaker with sliding-window failure and slow-call tracking.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryClass;

/// Lifecycle of a circuit breaker.
///
/// ```text
/// CLOSED ──rate over threshold──> OPEN
///   ^                               │
///   │                        wait elapses
///   │                               v
///   └──trials succeed──────── HALF_OPEN ──trials fail──> OPEN
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow through; outcomes feed the sliding window.
    Closed,
    /// Calls are rejected without invoking the operation.
    Open,
    /// A limited number of trial calls gauge recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Percentage of failed calls at or above which the circuit opens.
    pub failure_rate_threshold: f64,
    /// Percentage of slow calls at or above which the circuit opens.
    pub slow_call_rate_threshold: f64,
    /// Calls taking at least this long count as slow.
    pub slow_call_duration: Duration,
    /// Number of most recent calls kept in the sliding window.
    pub sliding_window_size: usize,
    /// Rates are not evaluated until the window holds this many calls.
    pub minimum_number_of_calls: usize,
    /// How long the circuit stays open before admitting trial calls.
    pub wait_duration_in_open_state: Duration,
    /// Trial calls admitted while half-open.
    pub permitted_calls_in_half_open: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration: Duration::from_secs(60),
            sliding_window_size: 100,
            minimum_number_of_calls: 10,
            wait_duration_in_open_state: Duration::from_secs(30),
            permitted_calls_in_half_open: 10,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without invoking the operation.
    #[error("circuit '{operation}' is open")]
    Open { operation: String },

    /// The operation ran and failed.
    #[error("{0}")]
    Failed(E),
}

impl<E: RetryClass> RetryClass for CircuitBreakerError<E> {
    fn class(&self) -> &str {
        match self {
            CircuitBreakerError::Open { .. } => "circuit_open",
            CircuitBreakerError::Failed(err) => err.class(),
        }
    }

    fn retryable_hint(&self) -> Option<bool> {
        match self {
            // An open circuit may admit the retry once the wait elapses.
            CircuitBreakerError::Open { .. } => None,
            CircuitBreakerError::Failed(err) => err.retryable_hint(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    failure: bool,
    slow: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: VecDeque<CallRecord>,
    opened_at: Option<Instant>,
    half_open_started: usize,
    half_open_results: Vec<CallRecord>,
    times_opened: u64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub calls_in_window: usize,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
    pub times_opened: u64,
}

/// Guards one named operation against cascading failure.
///
/// While closed, call outcomes feed a sliding window; once the window
/// holds [`minimum_number_of_calls`](CircuitBreakerConfig::minimum_number_of_calls)
/// and either the failure rate or the slow-call rate reaches its
/// threshold, the circuit opens and calls fail fast. After the wait
/// duration a limited batch of trial calls decides whether to close
/// again or reopen. State checks and transitions happen under one lock,
/// so concurrent callers observe a consistent state.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named operation.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_started: 0,
                half_open_results: Vec::new(),
                times_opened: 0,
            }),
        }
    }

    /// The operation name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Returns a snapshot of the breaker's counters and rates.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        let (failure_rate, slow_call_rate) = rates(&inner.window);
        BreakerStats {
            state: inner.state,
            calls_in_window: inner.window.len(),
            failure_rate,
            slow_call_rate,
            times_opened: inner.times_opened,
        }
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// Open circuits fail fast with [`CircuitBreakerError::Open`] and do
    /// not invoke the operation at all.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(CircuitBreakerError::Open {
                operation: self.name.clone(),
            });
        }

        let permit = CallPermit::new(self);
        let result = operation().await;
        permit.settle(result.is_ok());
        result.map_err(CircuitBreakerError::Failed)
    }

    /// Like [`execute`](Self::execute), but an open circuit yields the
    /// fallback value instead of an error.
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = T>,
    {
        match self.execute(operation).await {
            Err(CircuitBreakerError::Open { .. }) => {
                tracing::debug!(breaker = %self.name, "circuit open, using fallback");
                Ok(fallback().await)
            }
            other => other,
        }
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let waited = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.wait_duration_in_open_state)
                    .unwrap_or(true);
                if waited {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_started = 1;
                    inner.half_open_results.clear();
                    tracing::info!(breaker = %self.name, "circuit half-open, admitting trial calls");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_started < self.config.permitted_calls_in_half_open {
                    inner.half_open_started += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record(&self, success: bool, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let record = CallRecord {
            failure: !success,
            slow: elapsed >= self.config.slow_call_duration,
        };
        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(record);
                while inner.window.len() > self.config.sliding_window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.minimum_number_of_calls {
                    let (failure_rate, slow_call_rate) = rates(&inner.window);
                    if failure_rate >= self.config.failure_rate_threshold
                        || slow_call_rate >= self.config.slow_call_rate_threshold
                    {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.times_opened += 1;
                        tracing::warn!(
                            breaker = %self.name,
                            failure_rate,
                            slow_call_rate,
                            "circuit opened"
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_results.push(record);
                if inner.half_open_results.len() >= self.config.permitted_calls_in_half_open {
                    let (failure_rate, slow_call_rate) = rates(&inner.half_open_results);
                    if failure_rate >= self.config.failure_rate_threshold
                        || slow_call_rate >= self.config.slow_call_rate_threshold
                    {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.times_opened += 1;
                        tracing::warn!(breaker = %self.name, "circuit reopened after failed trials");
                    } else {
                        inner.state = CircuitState::Closed;
                        inner.window.clear();
                        inner.opened_at = None;
                        tracing::info!(breaker = %self.name, "circuit closed");
                    }
                    inner.half_open_results.clear();
                    inner.half_open_started = 0;
                }
            }
            // Late settle from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }
}

/// Tracks one admitted call until it settles.
///
/// An unsettled permit records a failure on drop, which frees the
/// half-open trial slot the call was holding.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    started: Instant,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            started: Instant::now(),
            settled: false,
        }
    }

    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(success, self.started.elapsed());
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(false, self.started.elapsed());
        }
    }
}

fn rates<'a, I>(records: I) -> (f64, f64)
where
    I: IntoIterator<Item = &'a CallRecord>,
{
    let mut total = 0usize;
    let mut failures = 0usize;
    let mut slow = 0usize;
    for record in records {
        total += 1;
        if record.failure {
            failures += 1;
        }
        if record.slow {
            slow += 1;
        }
    }
    if total == 0 {
        return (0.0, 0.0);
    }
    (
        failures as f64 / total as f64 * 100.0,
        slow as f64 / total as f64 * 100.0,
    )
}

/// Shares breakers across callers, one per operation name.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers start from `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: impl Into<String>) -> Arc<CircuitBreaker> {
        let name = name.into();
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Returns the breaker for `name` if it exists.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(name).cloned()
    }

    /// Current state of every registered breaker.
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .unwrap()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().unwrap().is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    async fn success_op() -> Result<&'static str, TestError> {
        Ok("ok")
    }

    async fn fail_op() -> Result<&'static str, TestError> {
        Err(TestError("boom"))
    }

    fn small_window_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: 10,
            minimum_number_of_calls: 10,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_state: Duration::from_millis(50),
            permitted_calls_in_half_open: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn closed_breaker_passes_calls_through() {
        let breaker = CircuitBreaker::new("payments", CircuitBreakerConfig::default());

        let result = breaker.execute(success_op).await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().calls_in_window, 1);
    }

    #[tokio::test]
    async fn opens_when_failure_rate_reaches_threshold() {
        let breaker = CircuitBreaker::new("payments", small_window_config());

        for _ in 0..5 {
            let _ = breaker.execute(fail_op).await;
        }
        for _ in 0..5 {
            let _ = breaker.execute(success_op).await;
        }

        // 5 failures out of 10 hits the 50% threshold exactly
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().times_opened, 1);
    }

    #[tokio::test]
    async fn stays_closed_below_minimum_number_of_calls() {
        let breaker = CircuitBreaker::new("payments", small_window_config());

        for _ in 0..9 {
            let _ = breaker.execute(fail_op).await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("payments", small_window_config());
        for _ in 0..10 {
            let _ = breaker.execute(fail_op).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, TestError>("unreachable") }
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_after_wait_duration() {
        let breaker = CircuitBreaker::new("payments", small_window_config());
        for _ in 0..10 {
            let _ = breaker.execute(fail_op).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = breaker.execute(success_op).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_successful_trials() {
        let breaker = CircuitBreaker::new("payments", small_window_config());
        for _ in 0..10 {
            let _ = breaker.execute(fail_op).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        for _ in 0..2 {
            let result = breaker.execute(success_op).await;
            assert!(result.is_ok());
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().calls_in_window, 0);
    }

    #[tokio::test]
    async fn half_open_reopens_after_failed_trials() {
        let breaker = CircuitBreaker::new("payments", small_window_config());
        for _ in 0..10 {
            let _ = breaker.execute(fail_op).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        for _ in 0..2 {
            let _ = breaker.execute(fail_op).await;
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().times_opened, 2);
    }

    #[tokio::test]
    async fn abandoned_trial_counts_as_a_failed_trial() {
        let config = CircuitBreakerConfig {
            sliding_window_size: 10,
            minimum_number_of_calls: 10,
            failure_rate_threshold: 60.0,
            wait_duration_in_open_state: Duration::from_millis(50),
            permitted_calls_in_half_open: 2,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("exports", config);
        for _ in 0..10 {
            let _ = breaker.execute(fail_op).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Admit a trial call, then drop it mid-flight.
        let hung = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, TestError>("never settles")
        });
        let raced = tokio::time::timeout(Duration::from_millis(20), hung).await;
        assert!(raced.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The dropped call settled its slot as a failure, so a single
        // success completes the trial batch below the failure threshold.
        let result = breaker.execute(success_op).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn slow_calls_trip_the_breaker() {
        let config = CircuitBreakerConfig {
            sliding_window_size: 4,
            minimum_number_of_calls: 4,
            slow_call_rate_threshold: 50.0,
            slow_call_duration: Duration::from_millis(10),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("reports", config);

        for _ in 0..4 {
            let _ = breaker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, TestError>("slow but fine")
                })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fallback_used_when_open() {
        let breaker = CircuitBreaker::new("payments", small_window_config());
        for _ in 0..10 {
            let _ = breaker.execute(fail_op).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker
            .execute_with_fallback(success_op, || async { "cached" })
            .await;

        assert_eq!(result.unwrap(), "cached");
    }

    #[tokio::test]
    async fn registry_shares_breakers_by_name() {
        let registry = CircuitBreakerRegistry::default();

        let first = registry.get_or_create("payments");
        let second = registry.get_or_create("payments");
        let other = registry.get_or_create("shipping");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.states().get("payments"),
            Some(&CircuitState::Closed)
        );
    }

    #[test]
    fn state_display_matches_convention() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn breaker_error_classification() {
        #[derive(Debug)]
        struct Classified;

        impl std::fmt::Display for Classified {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "classified")
            }
        }

        impl RetryClass for Classified {
            fn class(&self) -> &str {
                "timeout"
            }
        }

        let open: CircuitBreakerError<Classified> = CircuitBreakerError::Open {
            operation: "payments".into(),
        };
        assert_eq!(open.class(), "circuit_open");
        assert_eq!(open.retryable_hint(), None);

        let failed = CircuitBreakerError::Failed(Classified);
        assert_eq!(failed.class(), "timeout");
    }
}
