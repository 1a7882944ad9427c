//! Bulk retrieval jobs.
//!
//! A job is an ordered list of [`RetrievalTarget`]s split into batches of
//! `batch_size`. The dispatch loop keeps a bounded number of batches open:
//!
//! - Sequential: one batch resolves fully before the next opens
//! - Parallel: up to `max_concurrent_batches` batches open at once
//! - Adaptive: the cap is recomputed at every batch boundary from the rate
//!   governor, the download circuit and memory pressure
//!
//! Targets are dispatched strictly in list order and never twice. Progress
//! for a job is mutated under one lock, and callbacks run after it is
//! released so they may call back into the orchestrator (e.g. to pause).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::client::{ApiClient, DOWNLOAD_OPERATION};
use crate::error::{AppError, FailureKind};
use crate::job::{
    FailedTarget, FailureReason, JobHistoryRecord, JobOptions, JobProgress, JobStatus,
    ProcessingStrategy, ProgressUpdate, RetrievalTarget, TargetOutcome,
};
use crate::memory::{BackpressureConfig, MemoryProbe, ProcessMemoryProbe};
use crate::traits::{ArtifactSink, HistoryStore, Transport};

/// Invoked once per terminal target outcome.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Events emitted while jobs run.
#[derive(Debug)]
pub enum OrchestratorEvent<'a> {
    JobCreated {
        job_id: Uuid,
        name: &'a str,
        targets: usize,
    },
    JobStarted {
        job_id: Uuid,
        strategy: ProcessingStrategy,
    },
    TargetDispatched {
        job_id: Uuid,
        target_id: &'a str,
        batch: usize,
    },
    TargetRetrying {
        job_id: Uuid,
        target_id: &'a str,
        locator: &'a str,
        attempt: u32,
        delay: Duration,
        error: &'a AppError,
    },
    TargetCompleted {
        job_id: Uuid,
        target_id: &'a str,
        bytes: u64,
        attempts: u32,
    },
    TargetFailed {
        job_id: Uuid,
        target_id: &'a str,
        reason: &'a FailureReason,
    },
    JobPaused {
        job_id: Uuid,
    },
    JobResumed {
        job_id: Uuid,
    },
    JobCancelled {
        job_id: Uuid,
    },
    JobFinished {
        progress: &'a JobProgress,
    },
}

/// Receives orchestrator events.
pub trait OrchestratorReporter: Send + Sync {
    fn report(&self, event: OrchestratorEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl OrchestratorReporter for TracingReporter {
    fn report(&self, event: OrchestratorEvent<'_>) {
        match event {
            OrchestratorEvent::JobCreated {
                job_id,
                name,
                targets,
            } => {
                tracing::info!(%job_id, %name, targets, "Job created");
            }
            OrchestratorEvent::JobStarted { job_id, strategy } => {
                tracing::info!(%job_id, %strategy, "Job started");
            }
            OrchestratorEvent::TargetDispatched {
                job_id,
                target_id,
                batch,
            } => {
                tracing::debug!(%job_id, %target_id, batch, "Target dispatched");
            }
            OrchestratorEvent::TargetRetrying {
                job_id,
                target_id,
                locator,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    %job_id,
                    %target_id,
                    %locator,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %error,
                    "Target failed, retrying"
                );
            }
            OrchestratorEvent::TargetCompleted {
                job_id,
                target_id,
                bytes,
                attempts,
            } => {
                tracing::debug!(%job_id, %target_id, bytes, attempts, "Target completed");
            }
            OrchestratorEvent::TargetFailed {
                job_id,
                target_id,
                reason,
            } => {
                tracing::warn!(
                    %job_id,
                    %target_id,
                    kind = %reason.kind,
                    attempts = reason.attempts,
                    error = %reason.message,
                    "Target failed"
                );
            }
            OrchestratorEvent::JobPaused { job_id } => {
                tracing::info!(%job_id, "Job paused");
            }
            OrchestratorEvent::JobResumed { job_id } => {
                tracing::info!(%job_id, "Job resumed");
            }
            OrchestratorEvent::JobCancelled { job_id } => {
                tracing::info!(%job_id, "Job cancelled");
            }
            OrchestratorEvent::JobFinished { progress } => {
                tracing::info!(
                    job_id = %progress.job_id,
                    status = %progress.status,
                    completed = progress.completed,
                    failed = progress.failed,
                    pending = progress.pending,
                    "Job finished"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

struct JobState {
    progress: JobProgress,
    failures: Vec<FailedTarget>,
}

struct JobHandle {
    id: Uuid,
    /// Creation order within the orchestrator.
    seq: u64,
    targets: Arc<[RetrievalTarget]>,
    options: JobOptions,
    state: Mutex<JobState>,
    control: watch::Sender<Control>,
    /// Interrupts retry backoff once the job is cancelled.
    cancel: CancellationToken,
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl JobHandle {
    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        lock_or_recover(&self.state, self.id)
    }

    fn snapshot(&self) -> JobProgress {
        self.lock_state().progress.clone()
    }

    fn invalid(&self, status: JobStatus, action: &'static str) -> AppError {
        AppError::InvalidJobState {
            job_id: self.id,
            status,
            action,
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>, job_id: Uuid) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(%job_id, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

/// Tracks which batches have been opened and how many of their targets are
/// still unresolved.
#[derive(Debug)]
struct BatchTracker {
    batch_size: usize,
    unresolved: Vec<usize>,
    started: usize,
    open: usize,
}

impl BatchTracker {
    fn new(total: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let unresolved = (0..total.div_ceil(batch_size))
            .map(|b| batch_size.min(total - b * batch_size))
            .collect();
        Self {
            batch_size,
            unresolved,
            started: 0,
            open: 0,
        }
    }

    fn batch_of(&self, index: usize) -> usize {
        index / self.batch_size
    }

    /// True when dispatching `index` would open a new batch.
    fn opens_batch(&self, index: usize) -> bool {
        self.batch_of(index) >= self.started
    }

    fn open(&mut self, index: usize) {
        self.started = self.batch_of(index) + 1;
        self.open += 1;
    }

    fn resolve(&mut self, index: usize) {
        let batch = self.batch_of(index);
        if let Some(remaining) = self.unresolved.get_mut(batch) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.open = self.open.saturating_sub(1);
            }
        }
    }
}

/// In-flight targets of one running job.
struct Dispatcher {
    tasks: JoinSet<usize>,
    running: HashMap<Id, usize>,
    batches: BatchTracker,
}

/// Runs bulk retrieval jobs against one endpoint.
#[derive(Clone)]
pub struct BulkOrchestrator<T: Transport, S: ArtifactSink, H: HistoryStore> {
    client: ApiClient<T>,
    sink: S,
    history: H,
    memory: Arc<dyn MemoryProbe>,
    backpressure: BackpressureConfig,
    reporter: Arc<dyn OrchestratorReporter>,
    jobs: Arc<Mutex<HashMap<Uuid, Arc<JobHandle>>>>,
    next_seq: Arc<AtomicU64>,
}

impl<T: Transport, S: ArtifactSink, H: HistoryStore> BulkOrchestrator<T, S, H> {
    pub fn new(client: ApiClient<T>, sink: S, history: H) -> Self {
        Self {
            client,
            sink,
            history,
            memory: Arc::new(ProcessMemoryProbe::new()),
            backpressure: BackpressureConfig::default(),
            reporter: Arc::new(TracingReporter),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Memory limit used by Adaptive scheduling.
    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn OrchestratorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn client(&self) -> &ApiClient<T> {
        &self.client
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<JobHandle>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job table");
            poisoned.into_inner()
        })
    }

    fn job(&self, job_id: Uuid) -> Result<Arc<JobHandle>, AppError> {
        self.lock_jobs()
            .get(&job_id)
            .cloned()
            .ok_or(AppError::JobNotFound(job_id))
    }

    /// Register a PENDING job.
    pub fn create_job(
        &self,
        name: impl Into<String>,
        mut targets: Vec<RetrievalTarget>,
        options: JobOptions,
    ) -> Uuid {
        let name = name.into();
        let job_id = Uuid::new_v4();

        if options.order_by_priority {
            targets.sort_by_key(|t| std::cmp::Reverse(t.priority));
        }

        let (control, _) = watch::channel(Control::Run);
        let handle = JobHandle {
            id: job_id,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(JobState {
                progress: JobProgress::new(job_id, name.clone(), targets.len()),
                failures: Vec::new(),
            }),
            targets: targets.into(),
            options,
            control,
            cancel: CancellationToken::new(),
            callbacks: Mutex::new(Vec::new()),
        };

        self.reporter.report(OrchestratorEvent::JobCreated {
            job_id,
            name: &name,
            targets: handle.targets.len(),
        });
        self.lock_jobs().insert(job_id, Arc::new(handle));
        job_id
    }

    /// Drive a PENDING job to a terminal state on the current task.
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        let job = self.job(job_id)?;
        self.start(&job)?;
        Ok(self.drive(job).await)
    }

    /// Start a PENDING job on the runtime. The job is PROCESSING when this
    /// returns.
    pub fn spawn_job(&self, job_id: Uuid) -> Result<JoinHandle<JobProgress>, AppError> {
        let job = self.job(job_id)?;
        self.start(&job)?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.drive(job).await }))
    }

    pub fn get_job_status(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        Ok(self.job(job_id)?.snapshot())
    }

    pub fn register_progress_callback<F>(&self, job_id: Uuid, callback: F) -> Result<(), AppError>
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        let job = self.job(job_id)?;
        lock_or_recover(&job.callbacks, job_id).push(Arc::new(callback));
        Ok(())
    }

    /// Stop dispatching new targets. In-flight targets run to completion.
    pub fn pause_job(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        let job = self.job(job_id)?;
        let progress = {
            let mut state = job.lock_state();
            let status = state.progress.status;
            if status != JobStatus::Processing {
                return Err(job.invalid(status, "pause"));
            }
            state.progress.status = JobStatus::Paused;
            job.control.send_replace(Control::Pause);
            state.progress.clone()
        };
        self.reporter.report(OrchestratorEvent::JobPaused { job_id });
        Ok(progress)
    }

    /// Continue dispatch from the first target not yet dispatched.
    pub fn resume_job(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        let job = self.job(job_id)?;
        let progress = {
            let mut state = job.lock_state();
            let status = state.progress.status;
            if status != JobStatus::Paused {
                return Err(job.invalid(status, "resume"));
            }
            state.progress.status = JobStatus::Processing;
            job.control.send_replace(Control::Run);
            state.progress.clone()
        };
        self.reporter.report(OrchestratorEvent::JobResumed { job_id });
        Ok(progress)
    }

    /// Mark the job CANCELLED. In-flight network calls finish, pending
    /// retries are abandoned and nothing further is dispatched.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        let job = self.job(job_id)?;
        let (progress, never_started) = {
            let mut state = job.lock_state();
            let status = state.progress.status;
            if status.is_terminal() {
                return Err(job.invalid(status, "cancel"));
            }
            state.progress.status = JobStatus::Cancelled;
            if status == JobStatus::Pending {
                state.progress.completed_at = Some(Utc::now());
            }
            job.control.send_replace(Control::Cancel);
            (state.progress.clone(), status == JobStatus::Pending)
        };
        job.cancel.cancel();
        self.reporter.report(OrchestratorEvent::JobCancelled { job_id });

        // A running job is archived by its dispatch loop.
        if never_started {
            self.archive(&progress).await;
        }
        Ok(progress)
    }

    pub fn failed_targets(&self, job_id: Uuid) -> Result<Vec<FailedTarget>, AppError> {
        Ok(self.job(job_id)?.lock_state().failures.clone())
    }

    /// Every known job, oldest first.
    pub fn list_jobs(&self) -> Vec<JobProgress> {
        let mut jobs: Vec<Arc<JobHandle>> = self.lock_jobs().values().cloned().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.iter().map(|j| j.snapshot()).collect()
    }

    /// Forget a job that reached a terminal state.
    pub fn remove_job(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get(&job_id).ok_or(AppError::JobNotFound(job_id))?;
        let progress = job.snapshot();
        if !progress.status.is_terminal() {
            return Err(job.invalid(progress.status, "remove"));
        }
        jobs.remove(&job_id);
        Ok(progress)
    }

    fn start(&self, job: &JobHandle) -> Result<(), AppError> {
        {
            let mut state = job.lock_state();
            let status = state.progress.status;
            if status != JobStatus::Pending {
                return Err(job.invalid(status, "start"));
            }
            state.progress.status = JobStatus::Processing;
            state.progress.started_at = Some(Utc::now());
        }
        self.reporter.report(OrchestratorEvent::JobStarted {
            job_id: job.id,
            strategy: job.options.strategy,
        });
        Ok(())
    }

    /// Open-batch cap for the next batch boundary.
    fn batch_cap(&self, options: &JobOptions) -> usize {
        let max = options.max_concurrent_batches.max(1);
        match options.strategy {
            ProcessingStrategy::Sequential => 1,
            ProcessingStrategy::Parallel => max,
            ProcessingStrategy::Adaptive => {
                if self.client.circuits().state(DOWNLOAD_OPERATION) != CircuitState::Closed
                    || self.backpressure.is_over(self.memory.as_ref())
                {
                    return 1;
                }
                let utilization = self.client.governor().utilization();
                1 + ((max - 1) as f64 * utilization).round() as usize
            }
        }
    }

    async fn drive(&self, job: Arc<JobHandle>) -> JobProgress {
        let total = job.targets.len();
        let mut control = job.control.subscribe();
        let mut dispatcher = Dispatcher {
            tasks: JoinSet::new(),
            running: HashMap::new(),
            batches: BatchTracker::new(total, job.options.batch_size),
        };
        let mut next = 0;

        loop {
            let mode = *control.borrow_and_update();
            match mode {
                Control::Cancel => break,
                Control::Pause => {
                    while self.join_one(&job, &mut dispatcher).await {}
                    if next >= total || control.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                Control::Run => {}
            }

            if next >= total {
                if !self.join_one(&job, &mut dispatcher).await {
                    break;
                }
                continue;
            }

            if dispatcher.batches.opens_batch(next) {
                let cap = self.batch_cap(&job.options);
                if dispatcher.batches.open >= cap {
                    self.join_one(&job, &mut dispatcher).await;
                    continue;
                }
                dispatcher.batches.open(next);
            }

            self.dispatch(&job, next, &mut dispatcher);
            next += 1;
        }

        while self.join_one(&job, &mut dispatcher).await {}
        self.finalize(&job).await
    }

    fn dispatch(&self, job: &Arc<JobHandle>, index: usize, dispatcher: &mut Dispatcher) {
        let this = self.clone();
        let task_job = Arc::clone(job);
        let handle = dispatcher.tasks.spawn(async move {
            this.process_target(&task_job, index).await;
            index
        });
        dispatcher.running.insert(handle.id(), index);
    }

    /// Wait for one in-flight target. Returns false when none are left.
    async fn join_one(&self, job: &JobHandle, dispatcher: &mut Dispatcher) -> bool {
        let Some(joined) = dispatcher.tasks.join_next_with_id().await else {
            return false;
        };
        let index = match joined {
            Ok((id, index)) => {
                dispatcher.running.remove(&id);
                index
            }
            Err(e) => match dispatcher.running.remove(&e.id()) {
                Some(index) => {
                    self.record_task_failure(job, index, &e);
                    index
                }
                None => return true,
            },
        };
        dispatcher.batches.resolve(index);
        true
    }

    fn record_task_failure(&self, job: &JobHandle, index: usize, error: &JoinError) {
        tracing::error!(job_id = %job.id, error = %error, "Target task aborted");
        let target = &job.targets[index];
        let error = AppError::Generic(format!("Target task aborted: {error}"));
        self.apply_outcome(
            job,
            TargetOutcome::Failed(FailedTarget {
                target_id: target.id.clone(),
                reason: FailureReason::from_error(&error, 0),
            }),
        );
    }

    async fn process_target(&self, job: &JobHandle, index: usize) {
        let target = &job.targets[index];
        self.reporter.report(OrchestratorEvent::TargetDispatched {
            job_id: job.id,
            target_id: &target.id,
            batch: index / job.options.batch_size.max(1),
        });

        if let Some(outcome) = self.retrieve(job, target).await {
            self.apply_outcome(job, outcome);
        }
    }

    /// Walk the locator chain. Returns `None` if the job was cancelled while
    /// the target was waiting to retry; the target then stays pending.
    async fn retrieve(&self, job: &JobHandle, target: &RetrievalTarget) -> Option<TargetOutcome> {
        let options = &job.options;

        if let (Some(limit), Some(size)) = (options.max_target_bytes, target.expected_size)
            && size > limit
        {
            let error = AppError::ResourceExhausted(format!(
                "Target announces {size} bytes, limit is {limit}"
            ));
            return Some(self.fail(target, &error, 0).await);
        }

        let mut attempts = 0;
        let mut last_error = None;

        for locator in target.locators() {
            let mut attempt = 0;
            let error = loop {
                let result = self.download(target, locator, options.max_target_bytes).await;
                // A call the circuit rejected never reached the remote.
                let rejected = matches!(result, Err(AppError::CircuitOpen { .. }));
                if !rejected {
                    attempt += 1;
                    attempts += 1;
                }
                match result {
                    Ok(bytes) => {
                        return Some(TargetOutcome::Completed {
                            target_id: target.id.clone(),
                            bytes,
                            attempts,
                        });
                    }
                    Err(e)
                        if rejected
                            || (e.is_retryable() && attempt < options.retry.max_attempts) =>
                    {
                        let delay = options.retry.delay_for_attempt(attempt.max(1), &e);
                        self.reporter.report(OrchestratorEvent::TargetRetrying {
                            job_id: job.id,
                            target_id: &target.id,
                            locator,
                            attempt,
                            delay,
                            error: &e,
                        });
                        tokio::select! {
                            _ = job.cancel.cancelled() => return None,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => break e,
                }
            };

            let try_next = error.kind() == FailureKind::Permanent;
            if try_next {
                tracing::debug!(
                    job_id = %job.id,
                    target_id = %target.id,
                    %locator,
                    error = %error,
                    "Locator failed permanently"
                );
            }
            last_error = Some(error);
            if !try_next {
                break;
            }
        }

        let error = last_error
            .unwrap_or_else(|| AppError::Generic(format!("Target '{}' has no locator", target.id)));
        Some(self.fail(target, &error, attempts).await)
    }

    /// Fetch one locator into the sink, resuming from staged data.
    async fn download(
        &self,
        target: &RetrievalTarget,
        locator: &str,
        limit: Option<u64>,
    ) -> Result<u64, AppError> {
        let dest = target.destination_path.as_path();
        let offset = self.sink.begin(dest, target.expected_size).await?;
        let response = self.client.download(locator, offset).await?;

        // Anything but 206 is the whole artifact.
        let start = if response.status == 206 { offset } else { 0 };
        let bytes = start + response.body.len() as u64;
        if let Some(limit) = limit
            && bytes > limit
        {
            return Err(AppError::ResourceExhausted(format!(
                "Artifact is {bytes} bytes, limit is {limit}"
            )));
        }

        self.sink.append(dest, start, &response.body).await?;
        self.sink.commit(dest).await?;
        Ok(bytes)
    }

    /// Build a failed outcome. Staged data is kept only after transient
    /// exhaustion, so a later run can resume it.
    async fn fail(&self, target: &RetrievalTarget, error: &AppError, attempts: u32) -> TargetOutcome {
        if matches!(
            error.kind(),
            FailureKind::Permanent | FailureKind::ResourceExhausted
        ) && let Err(e) = self.sink.discard(&target.destination_path).await
        {
            tracing::warn!(target_id = %target.id, error = %e, "Failed to discard staged data");
        }
        TargetOutcome::Failed(FailedTarget {
            target_id: target.id.clone(),
            reason: FailureReason::from_error(error, attempts),
        })
    }

    fn apply_outcome(&self, job: &JobHandle, outcome: TargetOutcome) {
        let update = {
            let mut state = job.lock_state();
            state.progress.pending = state.progress.pending.saturating_sub(1);
            match &outcome {
                TargetOutcome::Completed { .. } => state.progress.completed += 1,
                TargetOutcome::Failed(failed) => {
                    state.progress.failed += 1;
                    state.failures.push(failed.clone());
                }
            }
            ProgressUpdate {
                job_id: job.id,
                progress: state.progress.clone(),
                outcome,
            }
        };

        match &update.outcome {
            TargetOutcome::Completed {
                target_id,
                bytes,
                attempts,
            } => self.reporter.report(OrchestratorEvent::TargetCompleted {
                job_id: job.id,
                target_id,
                bytes: *bytes,
                attempts: *attempts,
            }),
            TargetOutcome::Failed(failed) => self.reporter.report(OrchestratorEvent::TargetFailed {
                job_id: job.id,
                target_id: &failed.target_id,
                reason: &failed.reason,
            }),
        }

        let callbacks = lock_or_recover(&job.callbacks, job.id).clone();
        for callback in &callbacks {
            callback(&update);
        }
    }

    async fn finalize(&self, job: &JobHandle) -> JobProgress {
        let progress = {
            let mut state = job.lock_state();
            let progress = &mut state.progress;
            if progress.status != JobStatus::Cancelled {
                progress.status = if progress.failed > 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
            }
            progress.completed_at = Some(Utc::now());
            progress.clone()
        };
        self.reporter
            .report(OrchestratorEvent::JobFinished { progress: &progress });
        self.archive(&progress).await;
        progress
    }

    async fn archive(&self, progress: &JobProgress) {
        if let Err(e) = self
            .history
            .record_job(&JobHistoryRecord::from(progress))
            .await
        {
            tracing::warn!(job_id = %progress.job_id, error = %e, "Failed to record job history");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::job::RetryConfig;
    use crate::models::ApiResponse;
    use crate::testutil::{
        MockHistory, MockReporter, MockSink, MockTransport, ScriptedMemoryProbe, test_client,
    };

    type TestOrchestrator = BulkOrchestrator<MockTransport, MockSink, MockHistory>;

    fn locator(i: usize) -> String {
        format!("https://cdn.test/t{i}")
    }

    fn dest(i: usize) -> PathBuf {
        PathBuf::from(format!("/out/t{i}.bin"))
    }

    fn targets(n: usize) -> Vec<RetrievalTarget> {
        (0..n)
            .map(|i| RetrievalTarget::new(format!("t{i}"), locator(i), dest(i)))
            .collect()
    }

    fn serve_all(transport: &MockTransport, n: usize) {
        for i in 0..n {
            transport.respond(&locator(i), ApiResponse::new(200, format!("data-{i}")));
        }
    }

    fn orchestrator(transport: &MockTransport, sink: &MockSink, history: &MockHistory) -> TestOrchestrator {
        BulkOrchestrator::new(test_client(transport.clone()), sink.clone(), history.clone())
            .with_memory_probe(Arc::new(ScriptedMemoryProbe::constant(0)))
    }

    fn options(batch_size: usize) -> JobOptions {
        JobOptions::default()
            .with_batch_size(batch_size)
            .with_retry(
                RetryConfig::default()
                    .with_base_delay(Duration::from_millis(1))
                    .with_max_delay(Duration::from_millis(5)),
            )
    }

    async fn wait_for_status(orch: &TestOrchestrator, job_id: Uuid, status: JobStatus) {
        for _ in 0..400 {
            if orch.get_job_status(job_id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached {status}");
    }

    #[test]
    fn batch_tracker_counts_partial_last_batch() {
        let mut tracker = BatchTracker::new(10, 3);
        assert_eq!(tracker.unresolved, vec![3, 3, 3, 1]);

        assert!(tracker.opens_batch(0));
        tracker.open(0);
        assert!(!tracker.opens_batch(2));
        assert!(tracker.opens_batch(3));

        for i in 0..3 {
            tracker.resolve(i);
        }
        assert_eq!(tracker.open, 0);
    }

    #[tokio::test]
    async fn one_permanent_failure_marks_job_failed() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        let history = MockHistory::new();
        serve_all(&transport, 10);
        transport.respond(&locator(5), ApiResponse::new(404, "missing"));

        let orch = orchestrator(&transport, &sink, &history);
        let job_id = orch.create_job("ten", targets(10), options(3));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        orch.register_progress_callback(job_id, move |update| {
            assert!(update.progress.is_consistent());
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let progress = orch.run_job(job_id).await.unwrap();

        assert_eq!(progress.status, JobStatus::Failed);
        assert_eq!(progress.completed, 9);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.pending, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let failed = orch.failed_targets(job_id).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].target_id, "t5");
        assert_eq!(failed[0].reason.kind, FailureKind::Permanent);
        assert_eq!(failed[0].reason.attempts, 1);

        assert_eq!(sink.discarded(), vec![dest(5)]);
        assert!(sink.committed(&dest(5)).is_none());
        assert_eq!(sink.committed(&dest(4)).unwrap(), b"data-4");

        let records = history.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Failed);
        assert_eq!(records[0].failed, 1);
    }

    #[tokio::test]
    async fn pause_after_first_batch_then_resume() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        let history = MockHistory::new();
        serve_all(&transport, 12);

        let orch = orchestrator(&transport, &sink, &history);
        let job_id = orch.create_job("pausable", targets(12), options(4));

        let pauser = orch.clone();
        orch.register_progress_callback(job_id, move |update| {
            if update.progress.completed == 4 {
                pauser.pause_job(update.job_id).unwrap();
            }
        })
        .unwrap();

        let handle = orch.spawn_job(job_id).unwrap();
        wait_for_status(&orch, job_id, JobStatus::Paused).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let paused = orch.get_job_status(job_id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.completed, 4);
        assert_eq!(paused.pending, 8);
        assert_eq!(transport.call_count(), 4);
        assert!(orch.pause_job(job_id).is_err());

        orch.resume_job(job_id).unwrap();
        let progress = handle.await.unwrap();

        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(progress.completed, 12);

        let paths = transport.paths();
        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(paths.len(), 12);
        assert_eq!(unique.len(), 12);

        // Sequential batches commit strictly batch by batch.
        for (position, path) in sink.commit_order().iter().enumerate() {
            let index: usize = path
                .file_stem()
                .unwrap()
                .to_str()
                .unwrap()
                .trim_start_matches('t')
                .parse()
                .unwrap();
            assert_eq!(index / 4, position / 4);
        }
    }

    #[tokio::test]
    async fn control_operations_check_state() {
        let transport = MockTransport::new();
        let orch = orchestrator(&transport, &MockSink::new(), &MockHistory::new());
        let job_id = orch.create_job("idle", targets(1), options(1));

        assert!(matches!(
            orch.pause_job(job_id),
            Err(AppError::InvalidJobState {
                status: JobStatus::Pending,
                action: "pause",
                ..
            })
        ));
        assert!(orch.resume_job(job_id).is_err());
        assert!(orch.remove_job(job_id).is_err());
        assert!(matches!(
            orch.get_job_status(Uuid::new_v4()),
            Err(AppError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_pending_job_is_terminal() {
        let transport = MockTransport::new();
        let history = MockHistory::new();
        let orch = orchestrator(&transport, &MockSink::new(), &history);
        let job_id = orch.create_job("never", targets(3), options(1));

        let progress = orch.cancel_job(job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Cancelled);
        assert_eq!(progress.pending, 3);

        assert!(orch.run_job(job_id).await.is_err());
        assert!(orch.cancel_job(job_id).await.is_err());
        assert_eq!(transport.call_count(), 0);
        assert_eq!(history.records()[0].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_running_job_drains_and_stops() {
        let transport = MockTransport::new();
        let history = MockHistory::new();
        serve_all(&transport, 10);
        transport.set_delay(Duration::from_millis(20));

        let orch = orchestrator(&transport, &MockSink::new(), &history);
        let job_id = orch.create_job("cancel", targets(10), options(2));
        let handle = orch.spawn_job(job_id).unwrap();

        for _ in 0..400 {
            if orch.get_job_status(job_id).unwrap().completed >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        orch.cancel_job(job_id).await.unwrap();
        let progress = handle.await.unwrap();

        assert_eq!(progress.status, JobStatus::Cancelled);
        assert!(progress.is_consistent());
        assert!(progress.pending > 0);
        assert!(transport.call_count() <= 4);
        assert_eq!(history.records().last().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn fallback_locator_recovers_target() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        transport.respond(&locator(0), ApiResponse::new(410, "gone"));
        transport.respond("https://mirror.test/t0", ApiResponse::new(200, "mirror"));

        let orch = orchestrator(&transport, &sink, &MockHistory::new());
        let target = RetrievalTarget::new("t0", locator(0), dest(0)).with_fallback("https://mirror.test/t0");
        let job_id = orch.create_job("fallback", vec![target], options(1));

        let progress = orch.run_job(job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(sink.committed(&dest(0)).unwrap(), b"mirror");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        transport.push(&locator(0), Ok(ApiResponse::new(503, "busy")));
        transport.respond(&locator(0), ApiResponse::new(200, "ok"));
        let reporter = Arc::new(MockReporter::new());

        let orch = orchestrator(&transport, &sink, &MockHistory::new())
            .with_reporter(reporter.clone());
        let job_id = orch.create_job("retry", targets(1), options(1));

        let progress = orch.run_job(job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(transport.call_count(), 2);
        assert_eq!(reporter.count("TargetRetrying"), 1);
        assert_eq!(reporter.count("TargetCompleted"), 1);
    }

    #[tokio::test]
    async fn circuit_rejections_do_not_use_up_attempts() {
        use crate::cache::{CacheConfig, ResponseCache};
        use crate::circuit_breaker::{CircuitBreakerConfig, CircuitRegistry};
        use crate::governor::{RateGovernor, RateGovernorConfig};

        let transport = MockTransport::new();
        for i in 0..2 {
            transport.push(&locator(i), Ok(ApiResponse::new(503, "unavailable")));
        }
        serve_all(&transport, 4);
        for i in 2..4 {
            transport.delay_path(&locator(i), Duration::from_millis(400));
        }

        let client = ApiClient::new(
            transport.clone(),
            Arc::new(RateGovernor::new(
                "test",
                RateGovernorConfig::new(1000.0, 1.0, 1000.0),
            )),
            Arc::new(ResponseCache::new(CacheConfig::default())),
            CircuitRegistry::new(CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_millis(50),
                ..Default::default()
            }),
            Duration::from_secs(2),
        );
        let orch = BulkOrchestrator::new(client, MockSink::new(), MockHistory::new())
            .with_memory_probe(Arc::new(ScriptedMemoryProbe::constant(0)));
        let opts = options(4).with_retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(200)),
        );
        let job_id = orch.create_job("recovering", targets(4), opts);

        let progress = orch.run_job(job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!((progress.completed, progress.failed), (4, 0));
        // Rejected calls never reach the transport.
        assert_eq!(transport.call_count(), 6);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_staged_data() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        transport.respond(&locator(0), ApiResponse::new(502, "bad gateway"));
        sink.stage(dest(0), b"partial");

        let orch = orchestrator(&transport, &sink, &MockHistory::new());
        let opts = options(1).with_retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1)),
        );
        let job_id = orch.create_job("flaky", targets(1), opts);

        let progress = orch.run_job(job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Failed);

        let failed = orch.failed_targets(job_id).unwrap();
        assert_eq!(failed[0].reason.kind, FailureKind::Transient);
        assert_eq!(failed[0].reason.attempts, 2);
        assert_eq!(sink.staged(&dest(0)).unwrap(), b"partial");
        assert!(sink.discarded().is_empty());
    }

    #[tokio::test]
    async fn partial_content_resumes_staged_download() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        sink.stage(dest(0), b"abc");
        transport.respond(&locator(0), ApiResponse::new(206, "def"));

        let orch = orchestrator(&transport, &sink, &MockHistory::new());
        let job_id = orch.create_job("resume", targets(1), options(1));
        orch.run_job(job_id).await.unwrap();

        assert_eq!(sink.committed(&dest(0)).unwrap(), b"abcdef");
        let request = &transport.requests()[0];
        assert_eq!(request.headers.get("Range").unwrap(), "bytes=3-");
    }

    #[tokio::test]
    async fn full_reply_restarts_staged_download() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        sink.stage(dest(0), b"stale");
        transport.respond(&locator(0), ApiResponse::new(200, "fresh"));

        let orch = orchestrator(&transport, &sink, &MockHistory::new());
        let job_id = orch.create_job("restart", targets(1), options(1));
        orch.run_job(job_id).await.unwrap();

        assert_eq!(sink.committed(&dest(0)).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn oversized_target_fails_without_network() {
        let transport = MockTransport::new();
        let orch = orchestrator(&transport, &MockSink::new(), &MockHistory::new());
        let target = RetrievalTarget::new("big", locator(0), dest(0)).with_expected_size(10_000);
        let job_id = orch.create_job("big", vec![target], options(1).with_max_target_bytes(100));

        let progress = orch.run_job(job_id).await.unwrap();
        assert_eq!(progress.failed, 1);
        let failed = orch.failed_targets(job_id).unwrap();
        assert_eq!(failed[0].reason.kind, FailureKind::ResourceExhausted);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn full_disk_is_not_retried() {
        let transport = MockTransport::new();
        serve_all(&transport, 1);
        let sink = MockSink::new().with_begin_error(AppError::ResourceExhausted("disk full".into()));

        let orch = orchestrator(&transport, &sink, &MockHistory::new());
        let job_id = orch.create_job("disk", targets(1), options(1));
        orch.run_job(job_id).await.unwrap();

        let failed = orch.failed_targets(job_id).unwrap();
        assert_eq!(failed[0].reason.kind, FailureKind::ResourceExhausted);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn priority_ordering_is_stable() {
        let transport = MockTransport::new();
        let sink = MockSink::new();
        serve_all(&transport, 4);

        let mut list = targets(4);
        list[2].priority = 5;
        list[3].priority = 5;
        let orch = orchestrator(&transport, &sink, &MockHistory::new());
        let job_id = orch.create_job("prio", list, options(1).ordered_by_priority());
        orch.run_job(job_id).await.unwrap();

        assert_eq!(sink.commit_order(), vec![dest(2), dest(3), dest(0), dest(1)]);
    }

    #[tokio::test]
    async fn parallel_and_adaptive_jobs_complete() {
        for strategy in [ProcessingStrategy::Parallel, ProcessingStrategy::Adaptive] {
            let transport = MockTransport::new();
            serve_all(&transport, 9);
            let orch = orchestrator(&transport, &MockSink::new(), &MockHistory::new());
            let opts = options(2)
                .with_strategy(strategy)
                .with_max_concurrent_batches(3);
            let job_id = orch.create_job("many", targets(9), opts);

            let progress = orch.run_job(job_id).await.unwrap();
            assert_eq!(progress.status, JobStatus::Completed);
            assert_eq!(transport.call_count(), 9);
        }
    }

    #[test]
    fn adaptive_cap_drops_under_pressure() {
        let transport = MockTransport::new();
        let opts = options(2)
            .with_strategy(ProcessingStrategy::Adaptive)
            .with_max_concurrent_batches(5);

        let relaxed = orchestrator(&transport, &MockSink::new(), &MockHistory::new());
        assert!(relaxed.batch_cap(&opts) >= 1);
        assert!(relaxed.batch_cap(&opts) <= 5);

        let pressured = orchestrator(&transport, &MockSink::new(), &MockHistory::new())
            .with_memory_probe(Arc::new(ScriptedMemoryProbe::constant(1_000)))
            .with_backpressure(BackpressureConfig::default().with_threshold(10));
        assert_eq!(pressured.batch_cap(&opts), 1);

        let parallel = options(2)
            .with_strategy(ProcessingStrategy::Parallel)
            .with_max_concurrent_batches(5);
        assert_eq!(relaxed.batch_cap(&parallel), 5);
        assert_eq!(relaxed.batch_cap(&options(2)), 1);
    }

    #[tokio::test]
    async fn empty_job_completes() {
        let transport = MockTransport::new();
        let reporter = Arc::new(MockReporter::new());
        let orch = orchestrator(&transport, &MockSink::new(), &MockHistory::new())
            .with_reporter(reporter.clone());
        let job_id = orch.create_job("empty", Vec::new(), options(5));

        let progress = orch.run_job(job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(
            *reporter.events.lock().unwrap(),
            vec!["JobCreated", "JobStarted", "JobFinished"]
        );
    }

    #[tokio::test]
    async fn list_and_remove_jobs() {
        let transport = MockTransport::new();
        serve_all(&transport, 1);
        let orch = orchestrator(&transport, &MockSink::new(), &MockHistory::new());
        let first = orch.create_job("first", targets(1), options(1));
        let second = orch.create_job("second", targets(1), options(1));

        let names: Vec<_> = orch.list_jobs().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["first", "second"]);

        orch.run_job(first).await.unwrap();
        orch.remove_job(first).unwrap();
        assert!(matches!(
            orch.get_job_status(first),
            Err(AppError::JobNotFound(_))
        ));
        assert_eq!(orch.list_jobs().len(), 1);
        assert!(orch.remove_job(second).is_err());
    }
}
