//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheConfig, CacheSnapshot, ResponseCache};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitRegistry};
use crate::client::ApiClient;
use crate::error::AppError;
use crate::governor::{RateGovernor, RateGovernorConfig};
use crate::job::JobHistoryRecord;
use crate::memory::MemoryProbe;
use crate::models::{ApiRequest, ApiResponse};
use crate::orchestrator::{OrchestratorEvent, OrchestratorReporter};
use crate::traits::{ArtifactSink, HistoryStore, Transport};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<ApiResponse, AppError> + Send + Sync>;

#[derive(Default)]
struct TransportState {
    /// One-shot results per path, consumed before anything else.
    queued: HashMap<String, VecDeque<Result<ApiResponse, AppError>>>,
    /// Reply returned for a path every time once its queue is empty.
    fixed: HashMap<String, ApiResponse>,
    handler: Option<Handler>,
    requests: Vec<ApiRequest>,
    delay: Option<Duration>,
    path_delays: HashMap<String, Duration>,
}

/// Mock transport with per-path scripted replies.
///
/// Lookup order: queued result, fixed reply, handler, then a 404.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `path` with `response`.
    pub fn respond(&self, path: &str, response: ApiResponse) {
        self.state
            .lock()
            .unwrap()
            .fixed
            .insert(path.to_string(), response);
    }

    /// Queue a one-shot result for `path`.
    pub fn push(&self, path: &str, result: Result<ApiResponse, AppError>) {
        self.state
            .lock()
            .unwrap()
            .queued
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }

    /// Compute replies for paths without a scripted answer.
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, AppError> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().handler = Some(Arc::new(handler));
        self
    }

    /// Delay every reply, to simulate a slow remote.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Delay replies for one path only.
    pub fn delay_path(&self, path: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .path_delays
            .insert(path.to_string(), delay);
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Paths requested, in call order.
    pub fn paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        let (result, delay) = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            let queued = state
                .queued
                .get_mut(&request.path)
                .and_then(VecDeque::pop_front);
            let result = match queued {
                Some(result) => result,
                None => match state.fixed.get(&request.path) {
                    Some(response) => Ok(response.clone()),
                    None => match &state.handler {
                        Some(handler) => handler(request),
                        None => Ok(ApiResponse::new(404, "not found")),
                    },
                },
            };
            let delay = state.path_delays.get(&request.path).copied().or(state.delay);
            (result, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    staged: HashMap<PathBuf, Vec<u8>>,
    committed: HashMap<PathBuf, Vec<u8>>,
    commit_order: Vec<PathBuf>,
    discarded: Vec<PathBuf>,
    begin_error: Option<AppError>,
}

/// In-memory artifact sink.
#[derive(Clone, Default)]
pub struct MockSink {
    state: Arc<Mutex<SinkState>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `begin` call with `error`.
    pub fn with_begin_error(self, error: AppError) -> Self {
        self.state.lock().unwrap().begin_error = Some(error);
        self
    }

    /// Pretend an earlier attempt left `data` at the temporary path.
    pub fn stage(&self, dest: impl Into<PathBuf>, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .staged
            .insert(dest.into(), data.to_vec());
    }

    pub fn staged(&self, dest: &Path) -> Option<Vec<u8>> {
        self.state.lock().unwrap().staged.get(dest).cloned()
    }

    pub fn committed(&self, dest: &Path) -> Option<Vec<u8>> {
        self.state.lock().unwrap().committed.get(dest).cloned()
    }

    pub fn commit_order(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().commit_order.clone()
    }

    pub fn discarded(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().discarded.clone()
    }
}

impl ArtifactSink for MockSink {
    async fn begin(&self, dest: &Path, _expected_size: Option<u64>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.begin_error.take() {
            return Err(error);
        }
        Ok(state.staged.get(dest).map_or(0, |d| d.len() as u64))
    }

    async fn append(&self, dest: &Path, offset: u64, data: &[u8]) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let staged = state.staged.entry(dest.to_path_buf()).or_default();
        staged.truncate(offset as usize);
        staged.extend_from_slice(data);
        Ok(())
    }

    async fn commit(&self, dest: &Path) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let data = state.staged.remove(dest).unwrap_or_default();
        state.committed.insert(dest.to_path_buf(), data);
        state.commit_order.push(dest.to_path_buf());
        Ok(())
    }

    async fn discard(&self, dest: &Path) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.staged.remove(dest);
        state.discarded.push(dest.to_path_buf());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockHistory
// ---------------------------------------------------------------------------

/// History store that keeps everything in memory.
#[derive(Clone, Default)]
pub struct MockHistory {
    pub records: Arc<Mutex<Vec<JobHistoryRecord>>>,
    pub snapshot: Arc<Mutex<Option<CacheSnapshot>>>,
}

impl MockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: CacheSnapshot) -> Self {
        Self {
            records: Arc::default(),
            snapshot: Arc::new(Mutex::new(Some(snapshot))),
        }
    }

    pub fn records(&self) -> Vec<JobHistoryRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl HistoryStore for MockHistory {
    async fn record_job(&self, record: &JobHistoryRecord) -> Result<(), AppError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn save_cache(&self, snapshot: &CacheSnapshot) -> Result<(), AppError> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn load_cache(&self) -> Result<Option<CacheSnapshot>, AppError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// ScriptedMemoryProbe
// ---------------------------------------------------------------------------

/// Memory probe that replays scripted samples, then repeats `fallback`.
pub struct ScriptedMemoryProbe {
    samples: Mutex<VecDeque<u64>>,
    fallback: u64,
}

impl ScriptedMemoryProbe {
    pub fn new(samples: Vec<u64>, fallback: u64) -> Self {
        Self {
            samples: Mutex::new(samples.into()),
            fallback,
        }
    }

    pub fn constant(bytes: u64) -> Self {
        Self::new(Vec::new(), bytes)
    }
}

impl MemoryProbe for ScriptedMemoryProbe {
    fn used_bytes(&self) -> u64 {
        self.samples
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock orchestrator reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == label)
            .count()
    }
}

impl OrchestratorReporter for MockReporter {
    fn report(&self, event: OrchestratorEvent<'_>) {
        let label = match &event {
            OrchestratorEvent::JobCreated { .. } => "JobCreated",
            OrchestratorEvent::JobStarted { .. } => "JobStarted",
            OrchestratorEvent::TargetDispatched { .. } => "TargetDispatched",
            OrchestratorEvent::TargetRetrying { .. } => "TargetRetrying",
            OrchestratorEvent::TargetCompleted { .. } => "TargetCompleted",
            OrchestratorEvent::TargetFailed { .. } => "TargetFailed",
            OrchestratorEvent::JobPaused { .. } => "JobPaused",
            OrchestratorEvent::JobResumed { .. } => "JobResumed",
            OrchestratorEvent::JobCancelled { .. } => "JobCancelled",
            OrchestratorEvent::JobFinished { .. } => "JobFinished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A JSON page envelope in the default layout.
pub fn page_body(items: &[serde_json::Value], next: Option<&str>) -> ApiResponse {
    let body = serde_json::json!({ "items": items, "next_cursor": next });
    ApiResponse::new(200, body.to_string())
}

/// Client with a fast governor, default cache and a low circuit threshold.
pub fn test_client(transport: MockTransport) -> ApiClient<MockTransport> {
    ApiClient::new(
        transport,
        Arc::new(RateGovernor::new(
            "test",
            RateGovernorConfig::new(1000.0, 1.0, 1000.0),
        )),
        Arc::new(ResponseCache::new(CacheConfig::default())),
        CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        }),
        Duration::from_millis(500),
    )
}
