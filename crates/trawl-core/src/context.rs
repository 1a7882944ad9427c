//! Shared state for one logical remote endpoint.
//!
//! The rate governor, response cache and circuit registry are created once
//! here and shared by every paginated stream and bulk job built from the
//! context.

use std::sync::Arc;

use crate::cache::{CacheSnapshot, ResponseCache};
use crate::circuit_breaker::CircuitRegistry;
use crate::client::ApiClient;
use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::governor::RateGovernor;
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::orchestrator::BulkOrchestrator;
use crate::paginate::PaginatedRetriever;
use crate::traits::{ArtifactSink, HistoryStore, Transport};

pub struct RetrievalContext<T: Transport, H: HistoryStore> {
    config: PipelineConfig,
    client: ApiClient<T>,
    history: H,
    memory: Arc<dyn MemoryProbe>,
}

impl<T: Transport, H: HistoryStore> RetrievalContext<T, H> {
    /// Build a context with a cold cache.
    pub fn new(transport: T, history: H, config: PipelineConfig) -> Self {
        let client = ApiClient::new(
            transport,
            Arc::new(RateGovernor::new(
                config.endpoint_name.clone(),
                config.governor,
            )),
            Arc::new(ResponseCache::new(config.cache)),
            CircuitRegistry::new(config.circuit.clone()),
            config.request_timeout,
        );
        Self {
            config,
            client,
            history,
            memory: Arc::new(ProcessMemoryProbe::new()),
        }
    }

    /// Build a context and warm its cache from the last saved snapshot.
    ///
    /// A snapshot that cannot be loaded is logged and skipped.
    pub async fn start(transport: T, history: H, config: PipelineConfig) -> Self {
        let context = Self::new(transport, history, config);
        if let Err(e) = context.restore_cache().await {
            tracing::warn!(
                endpoint = %context.config.endpoint_name,
                error = %e,
                "Could not restore cache snapshot, starting cold"
            );
        }
        context
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client(&self) -> &ApiClient<T> {
        &self.client
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    /// Re-insert the stored snapshot. Returns the number of live entries
    /// restored.
    pub async fn restore_cache(&self) -> Result<usize, AppError> {
        let Some(snapshot) = self.history.load_cache().await? else {
            return Ok(0);
        };
        let restored = self.client.cache().restore(&snapshot);
        tracing::info!(
            endpoint = %self.config.endpoint_name,
            restored,
            offered = snapshot.entries.len(),
            "Cache restored"
        );
        Ok(restored)
    }

    /// Paginated stream over `endpoint`, with this context's backpressure.
    pub fn paginate(&self, endpoint: impl Into<String>) -> PaginatedRetriever<T> {
        PaginatedRetriever::new(self.client.clone(), endpoint)
            .with_backpressure(self.config.backpressure, Arc::clone(&self.memory))
    }

    /// Orchestrator sharing this context's client and history store.
    pub fn orchestrator<S: ArtifactSink>(&self, sink: S) -> BulkOrchestrator<T, S, H> {
        BulkOrchestrator::new(self.client.clone(), sink, self.history.clone())
            .with_memory_probe(Arc::clone(&self.memory))
            .with_backpressure(self.config.backpressure)
    }

    /// Persist the live cache entries through the history store.
    pub async fn shutdown(&self) -> Result<CacheSnapshot, AppError> {
        let cache = self.client.cache();
        let purged = cache.purge_expired();
        let snapshot = cache.backup();
        self.history.save_cache(&snapshot).await?;
        tracing::info!(
            endpoint = %self.config.endpoint_name,
            entries = snapshot.entries.len(),
            purged,
            "Cache snapshot saved"
        );
        Ok(snapshot)
    }
}
