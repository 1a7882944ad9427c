//! Circuit breaker pattern for remote-call resilience.
//!
//! Isolates the pipeline from a dependency that keeps failing, so that a
//! dead endpoint costs one fast rejection per call instead of one timeout.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cooldown]--> HALF_OPEN (one probe)
//!                                      ^                                   |
//!                                      +------------[probe fails]----------+
//!                                                                          |
//! CLOSED <-------------------------[probe succeeds]------------------------+
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;

/// Current phase of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a single probe is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Failure ratio over the last `failure_rate_window` calls that also
    /// opens the circuit. Ignored while the window is not yet full.
    pub failure_rate_threshold: f64,

    /// Size of the sliding outcome window. Zero disables the rate check.
    pub failure_rate_window: usize,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// When a rate limit is detected, multiply recovery_timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum recovery timeout after rate limit backoffs.
    pub max_recovery_timeout: Duration,

    /// Number of recent calls kept in the call log.
    pub call_log_capacity: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            failure_rate_window: 0,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
            call_log_capacity: 64,
        }
    }
}

/// How an attempted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// Failed with an error that counts against the circuit.
    Failure,
    /// Failed with an error that says nothing about the dependency's health
    /// (e.g. a 404 for one resource).
    Ignored,
}

/// Latency and outcome of one attempted call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallRecord {
    pub at: DateTime<Utc>,
    pub latency: Duration,
    pub outcome: CallOutcome,
    /// Phase the call was admitted in.
    pub phase: CircuitState,
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
    probe_in_flight: bool,
    window: VecDeque<bool>,
    call_log: VecDeque<CallRecord>,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_failure_at: None,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
            probe_in_flight: false,
            window: VecDeque::new(),
            call_log: VecDeque::new(),
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn time_until_half_open(&self) -> Duration {
        self.last_failure_time
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }

    /// A call admitted before the circuit went half-open cannot settle the
    /// probe.
    fn is_stale(&self, admitted_in: Option<CircuitState>) -> bool {
        self.state == CircuitState::HalfOpen
            && admitted_in.is_some_and(|phase| phase != CircuitState::HalfOpen)
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.probe_in_flight = false;
        self.window.clear();
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub recent_calls: Vec<CallRecord>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - request was rejected without calling the service.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { name, retry_after } => {
                AppError::CircuitOpen { name, retry_after }
            }
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Thread-safe circuit breaker for protecting remote calls.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Clears the probe slot if a half-open probe is dropped before it records
/// an outcome, so a cancelled probe cannot wedge the circuit.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock_inner();
            inner.probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.time_until_half_open());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            recent_calls: inner.call_log.iter().copied().collect(),
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `CircuitBreakerError::Open` immediately
    /// - HalfOpen: admits exactly one probe; concurrent callers are rejected
    ///   until the probe resolves
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let admitted_in = {
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner);

            let reject = match inner.state {
                CircuitState::Open => true,
                CircuitState::HalfOpen => inner.probe_in_flight,
                CircuitState::Closed => false,
            };
            if reject {
                inner.rejected_calls += 1;
                // The probe's outcome is unknown, so check back after a cooldown.
                let retry_after = match inner.state {
                    CircuitState::HalfOpen => inner.current_recovery_timeout,
                    _ => inner.time_until_half_open(),
                };
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
            if inner.state == CircuitState::HalfOpen {
                tracing::debug!(circuit = %self.name, "Admitting half-open probe");
                inner.probe_in_flight = true;
            }
            inner.state
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admitted_in == CircuitState::HalfOpen,
        };

        let started = Instant::now();
        let result = operation().await;
        let latency = started.elapsed();

        let phase = Some(admitted_in);
        let outcome = match &result {
            Ok(_) => {
                self.settle_success(phase);
                CallOutcome::Success
            }
            Err(e) if e.should_trip_circuit() => {
                self.settle_failure(phase, e);
                CallOutcome::Failure
            }
            Err(_) => {
                // The dependency answered; it is reachable.
                self.settle_success(phase);
                CallOutcome::Ignored
            }
        };
        guard.armed = false;
        self.record_call(admitted_in, latency, outcome);

        result.map_err(CircuitBreakerError::Inner)
    }

    fn record_call(&self, phase: CircuitState, latency: Duration, outcome: CallOutcome) {
        let mut inner = self.lock_inner();
        inner.total_calls += 1;
        if outcome == CallOutcome::Failure {
            inner.total_failures += 1;
        }
        if self.config.call_log_capacity > 0 {
            while inner.call_log.len() >= self.config.call_log_capacity {
                inner.call_log.pop_front();
            }
            inner.call_log.push_back(CallRecord {
                at: Utc::now(),
                latency,
                outcome,
                phase,
            });
        }
        tracing::trace!(
            circuit = %self.name,
            latency_ms = latency.as_millis() as u64,
            ?outcome,
            "Call recorded"
        );
    }

    fn push_window(&self, inner: &mut CircuitBreakerInner, failed: bool) {
        if self.config.failure_rate_window == 0 {
            return;
        }
        while inner.window.len() >= self.config.failure_rate_window {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn window_tripped(&self, inner: &CircuitBreakerInner) -> bool {
        let size = self.config.failure_rate_window;
        if size == 0 || inner.window.len() < size {
            return false;
        }
        let failures = inner.window.iter().filter(|f| **f).count();
        failures as f64 / size as f64 >= self.config.failure_rate_threshold
    }

    /// Record a success against the current phase.
    pub fn record_success(&self) {
        self.settle_success(None);
    }

    /// Record a failure against the current phase.
    pub fn record_failure(&self, error: &AppError) {
        self.settle_failure(None, error);
    }

    fn settle_success(&self, admitted_in: Option<CircuitState>) {
        let mut inner = self.lock_inner();
        if inner.is_stale(admitted_in) {
            tracing::debug!(circuit = %self.name, "Ignoring straggler success while probe is pending");
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.probe_in_flight = false;
                inner.last_error_message = None;
                inner.current_recovery_timeout = self.config.recovery_timeout;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                self.push_window(&mut inner, false);
            }
            CircuitState::Open => {}
        }
    }

    fn settle_failure(&self, admitted_in: Option<CircuitState>, error: &AppError) {
        let mut inner = self.lock_inner();
        if inner.is_stale(admitted_in) {
            inner.last_error_message = Some(error.to_string());
            return;
        }

        let is_rate_limit = matches!(error, AppError::RateLimited { .. });

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                inner.last_error_message = Some(error.to_string());
                self.push_window(&mut inner, true);

                let consecutive = inner.failure_count >= self.config.failure_threshold;
                if consecutive || self.window_tripped(&inner) {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening"
                    );
                    inner.open();

                    if is_rate_limit {
                        self.extend_recovery_timeout(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.open();
                inner.last_failure_time = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                inner.last_error_message = Some(error.to_string());

                if is_rate_limit {
                    self.extend_recovery_timeout(&mut inner);
                }
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    fn extend_recovery_timeout(&self, inner: &mut CircuitBreakerInner) {
        inner.current_recovery_timeout = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_recovery_timeout.as_secs_f32()
                    * self.config.rate_limit_backoff_multiplier,
            ),
            self.config.max_recovery_timeout,
        );
        tracing::info!(
            circuit = %self.name,
            recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
            "Extended recovery timeout due to rate limit"
        );
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new(&self.config);
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

/// One circuit breaker per logical operation name.
#[derive(Clone)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> CircuitBreaker {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.config.clone()))
            .clone()
    }

    /// Phase of `name` without creating a breaker; unknown names are closed.
    pub fn state(&self, name: &str) -> CircuitState {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .get(name)
            .map(CircuitBreaker::state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<CircuitBreaker> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<_> = breakers.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
