pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod governor;
pub mod job;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod paginate;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use cache::{CacheConfig, CacheKey, CacheSnapshot, ResponseCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitRegistry, CircuitState};
pub use client::ApiClient;
pub use config::PipelineConfig;
pub use context::RetrievalContext;
pub use error::{AppError, FailureKind};
pub use governor::{RateBudget, RateGovernor, RateGovernorConfig};
pub use job::{
    FailedTarget, JobOptions, JobProgress, JobStatus, ProcessingStrategy, ProgressUpdate,
    RetrievalTarget, RetryConfig, TargetOutcome,
};
pub use memory::{BackpressureConfig, MemoryProbe, ProcessMemoryProbe};
pub use models::{ApiRequest, ApiResponse, compute_hash};
pub use orchestrator::{BulkOrchestrator, OrchestratorEvent, OrchestratorReporter, TracingReporter};
pub use paginate::{PageLayout, PaginatedRetriever};
pub use traits::{ArtifactSink, HistoryStore, NullHistory, Transport};
