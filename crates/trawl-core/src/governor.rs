//! Adaptive request-rate governing for one logical remote endpoint.
//!
//! The governor spaces outbound calls by `1 / current_rate` seconds and
//! nudges the rate up after every success and down, immediately, whenever
//! the remote signals throttling.
//!
//! # Example
//!
//! ```rust,no_run
//! use trawl_core::governor::{RateGovernor, RateGovernorConfig};
//!
//! # async fn run() {
//! let governor = RateGovernor::new("catalog", RateGovernorConfig::default());
//! governor.wait().await;
//! // ... perform the request ...
//! governor.record_success();
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slowest rate the governor will settle at: one call every ~17 minutes.
pub const MIN_RATE_FLOOR: f64 = 0.001;

/// Configuration for the rate governor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateGovernorConfig {
    /// Starting rate in requests per second.
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Multiplier applied after every successful call.
    pub increase_factor: f64,
    /// Multiplier applied after every rate-limit signal.
    pub decrease_factor: f64,
    /// Number of adjustments kept for introspection.
    pub history_capacity: usize,
}

impl Default for RateGovernorConfig {
    fn default() -> Self {
        Self {
            initial_rate: 5.0,
            min_rate: 0.5,
            max_rate: 20.0,
            increase_factor: 1.05,
            decrease_factor: 0.8,
            history_capacity: 100,
        }
    }
}

impl RateGovernorConfig {
    pub fn new(initial_rate: f64, min_rate: f64, max_rate: f64) -> Self {
        Self {
            initial_rate,
            min_rate,
            max_rate,
            ..Default::default()
        }
    }

    pub fn with_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.increase_factor = increase;
        self.decrease_factor = decrease;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Normalise bounds so that
    /// `MIN_RATE_FLOOR <= min_rate <= initial_rate <= max_rate`.
    fn normalized(mut self) -> Self {
        if !(self.min_rate >= MIN_RATE_FLOOR) {
            self.min_rate = MIN_RATE_FLOOR;
        }
        if !(self.max_rate >= self.min_rate) {
            self.max_rate = self.min_rate;
        }
        self.initial_rate = self.initial_rate.clamp(self.min_rate, self.max_rate);
        self
    }
}

/// Snapshot of the current rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateBudget {
    pub current_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub last_adjustment_at: Option<DateTime<Utc>>,
}

impl RateBudget {
    /// Minimum spacing between two permitted calls at the current rate.
    pub fn interval(&self) -> Duration {
        let rate = self.current_rate.max(MIN_RATE_FLOOR);
        Duration::try_from_secs_f64(1.0 / rate)
            .unwrap_or_else(|_| Duration::from_secs_f64(1.0 / MIN_RATE_FLOOR))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Success,
    RateLimited,
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentReason::Success => write!(f, "success"),
            AdjustmentReason::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// One entry of the adjustment history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateAdjustment {
    pub at: DateTime<Utc>,
    pub reason: AdjustmentReason,
    pub rate_before: f64,
    pub rate_after: f64,
}

#[derive(Debug)]
struct GovernorState {
    budget: RateBudget,
    /// Time slot granted to the most recent caller of `wait`.
    last_permit: Option<Instant>,
    history: VecDeque<RateAdjustment>,
}

/// Throttles outbound calls to one logical endpoint.
///
/// Thread-safe: all callers share one "last permitted call" slot, so the
/// minimum interval holds across tasks, not per task.
#[derive(Debug)]
pub struct RateGovernor {
    name: String,
    config: RateGovernorConfig,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(name: impl Into<String>, config: RateGovernorConfig) -> Self {
        let config = config.normalized();
        Self {
            name: name.into(),
            state: Mutex::new(GovernorState {
                budget: RateBudget {
                    current_rate: config.initial_rate,
                    min_rate: config.min_rate,
                    max_rate: config.max_rate,
                    last_adjustment_at: None,
                },
                last_permit: None,
                history: VecDeque::with_capacity(config.history_capacity.min(1024)),
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(governor = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Suspend until the minimum interval since the last permitted call has
    /// elapsed. The first call on a fresh governor returns immediately.
    ///
    /// Each caller reserves its slot before sleeping, so the lock is never
    /// held across the suspension.
    pub async fn wait(&self) {
        let sleep_until = {
            let mut state = self.lock_state();
            let now = Instant::now();
            let interval = state.budget.interval();
            let slot = match state.last_permit {
                None => now,
                Some(last) => (last + interval).max(now),
            };
            state.last_permit = Some(slot);
            (slot > now).then_some(slot)
        };

        if let Some(slot) = sleep_until {
            tracing::trace!(
                governor = %self.name,
                sleep_ms = %slot.saturating_duration_since(Instant::now()).as_millis(),
                "Throttling request"
            );
            tokio::time::sleep_until(tokio::time::Instant::from_std(slot)).await;
        }
    }

    /// Multiply the rate by the increase factor, capped at `max_rate`.
    pub fn record_success(&self) {
        self.adjust(AdjustmentReason::Success, self.config.increase_factor);
    }

    /// Multiply the rate by the decrease factor, floored at `min_rate`.
    pub fn record_rate_limited(&self) {
        self.adjust(AdjustmentReason::RateLimited, self.config.decrease_factor);
    }

    fn adjust(&self, reason: AdjustmentReason, factor: f64) {
        let mut state = self.lock_state();
        let before = state.budget.current_rate;
        let after = (before * factor).clamp(state.budget.min_rate, state.budget.max_rate);
        if after == before {
            return;
        }

        let at = Utc::now();
        state.budget.current_rate = after;
        state.budget.last_adjustment_at = Some(at);

        if self.config.history_capacity > 0 {
            while state.history.len() >= self.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(RateAdjustment {
                at,
                reason,
                rate_before: before,
                rate_after: after,
            });
        }

        match reason {
            AdjustmentReason::RateLimited => tracing::warn!(
                governor = %self.name,
                rate_before = before,
                rate_after = after,
                "Rate limited by remote, slowing down"
            ),
            AdjustmentReason::Success => tracing::trace!(
                governor = %self.name,
                rate_before = before,
                rate_after = after,
                "Rate increased"
            ),
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.lock_state().budget.current_rate
    }

    pub fn budget(&self) -> RateBudget {
        self.lock_state().budget
    }

    /// Adjustment history, oldest first.
    pub fn history(&self) -> Vec<RateAdjustment> {
        self.lock_state().history.iter().copied().collect()
    }

    /// Position of the current rate inside `[min_rate, max_rate]`, from 0.0
    /// (floored) to 1.0 (at the cap).
    pub fn utilization(&self) -> f64 {
        let budget = self.budget();
        let span = budget.max_rate - budget.min_rate;
        if span <= f64::EPSILON {
            return 1.0;
        }
        ((budget.current_rate - budget.min_rate) / span).clamp(0.0, 1.0)
    }
}
