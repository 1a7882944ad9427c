use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, FailureKind};

/// Status of a bulk retrieval job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// How batches of a job are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStrategy {
    /// One batch fully resolves before the next starts.
    Sequential,
    /// Up to `max_concurrent_batches` batches run at once.
    Parallel,
    /// The batch cap follows the rate budget, circuit phase and memory.
    Adaptive,
}

impl ProcessingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStrategy::Sequential => "sequential",
            ProcessingStrategy::Parallel => "parallel",
            ProcessingStrategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(ProcessingStrategy::Sequential),
            "parallel" => Ok(ProcessingStrategy::Parallel),
            "adaptive" => Ok(ProcessingStrategy::Adaptive),
            _ => Err(format!("Unknown processing strategy: {}", s)),
        }
    }
}

/// Retry configuration with exponential backoff.
///
/// Transient failures wait `base_delay * multiplier^(attempt-1)`; rate-limit
/// signals additionally scale by `rate_limit_multiplier` and never wait less
/// than the remote's `Retry-After`. A rejection by an open circuit waits
/// out the remaining cooldown. All delays are capped by `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per locator, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub rate_limit_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            rate_limit_multiplier: 4.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32, error: &AppError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let mut secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let mut floor = Duration::ZERO;

        match error {
            AppError::RateLimited { retry_after } => {
                secs *= self.rate_limit_multiplier;
                floor = retry_after.unwrap_or_default();
            }
            AppError::CircuitOpen { retry_after, .. } => floor = *retry_after,
            _ => {}
        }

        let computed = Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()));
        computed.max(floor).min(self.max_delay)
    }
}

/// A single artifact to retrieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalTarget {
    pub id: String,
    pub resource_locator: String,
    pub expected_size: Option<u64>,
    pub destination_path: PathBuf,
    /// Higher runs earlier when the job orders by priority.
    pub priority: i32,
    /// Alternate locators tried in order after the primary fails permanently.
    #[serde(default)]
    pub fallback_locators: Vec<String>,
}

impl RetrievalTarget {
    pub fn new(
        id: impl Into<String>,
        resource_locator: impl Into<String>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_locator: resource_locator.into(),
            expected_size: None,
            destination_path: destination_path.into(),
            priority: 0,
            fallback_locators: Vec::new(),
        }
    }

    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = Some(bytes);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fallback(mut self, locator: impl Into<String>) -> Self {
        self.fallback_locators.push(locator.into());
        self
    }

    /// Primary locator followed by the fallbacks.
    pub fn locators(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.resource_locator.as_str())
            .chain(self.fallback_locators.iter().map(String::as_str))
    }
}

/// Per-job scheduling options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub batch_size: usize,
    pub strategy: ProcessingStrategy,
    /// Upper bound on open batches for Parallel and Adaptive.
    pub max_concurrent_batches: usize,
    pub retry: RetryConfig,
    /// Targets announcing a larger `expected_size` fail as resource-exhausted.
    pub max_target_bytes: Option<u64>,
    /// Stable-sort targets by descending priority at job creation.
    pub order_by_priority: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            strategy: ProcessingStrategy::Sequential,
            max_concurrent_batches: 4,
            retry: RetryConfig::default(),
            max_target_bytes: None,
            order_by_priority: false,
        }
    }
}

impl JobOptions {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: ProcessingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_concurrent_batches(mut self, batches: usize) -> Self {
        self.max_concurrent_batches = batches.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_target_bytes(mut self, bytes: u64) -> Self {
        self.max_target_bytes = Some(bytes);
        self
    }

    pub fn ordered_by_priority(mut self) -> Self {
        self.order_by_priority = true;
        self
    }
}

/// Observable progress of a job.
///
/// `completed + failed + pending == total` holds for every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub name: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    pub fn new(job_id: Uuid, name: impl Into<String>, total: usize) -> Self {
        Self {
            job_id,
            name: name.into(),
            total,
            completed: 0,
            failed: 0,
            pending: total,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction of targets that reached a terminal outcome.
    pub fn fraction_done(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed + self.failed) as f64 / self.total as f64
    }

    pub fn is_consistent(&self) -> bool {
        self.completed + self.failed + self.pending == self.total
    }
}

/// Why a target failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
    /// Attempts spent across every locator.
    pub attempts: u32,
}

impl FailureReason {
    pub fn from_error(error: &AppError, attempts: u32) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            attempts,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub target_id: String,
    pub reason: FailureReason,
}

/// Terminal result of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Completed {
        target_id: String,
        bytes: u64,
        attempts: u32,
    },
    Failed(FailedTarget),
}

/// Delivered to progress callbacks once per terminal target outcome.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub outcome: TargetOutcome,
    /// Progress right after this outcome was applied.
    pub progress: JobProgress,
}

/// Summary handed to the history collaborator at a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub job_id: Uuid,
    pub name: String,
    pub target_count: usize,
    pub completed: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

impl From<&JobProgress> for JobHistoryRecord {
    fn from(progress: &JobProgress) -> Self {
        Self {
            job_id: progress.job_id,
            name: progress.name.clone(),
            target_count: progress.total,
            completed: progress.completed,
            failed: progress.failed,
            started_at: progress.started_at,
            completed_at: progress.completed_at,
            status: progress.status,
        }
    }
}
