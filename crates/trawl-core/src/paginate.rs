//! Lazy, memory-bounded stream over a cursor-paginated listing endpoint.
//!
//! Pages are fetched one at a time, only once the consumer has drained the
//! previous one. Before each fetch the retriever samples process memory and
//! waits while it is above the backpressure threshold.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::Stream;
use serde_json::Value;

use crate::client::{ApiClient, PAGE_OPERATION};
use crate::error::AppError;
use crate::job::RetryConfig;
use crate::memory::{BackpressureConfig, MemoryProbe, ProcessMemoryProbe};
use crate::traits::Transport;

/// Field names of the JSON page envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLayout {
    /// Array of items on the page.
    pub items_field: String,
    /// Continuation token. Missing, null or empty ends the listing.
    pub next_field: String,
    /// Query parameter that carries the token on the next request.
    pub cursor_param: String,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            items_field: "items".to_string(),
            next_field: "next_cursor".to_string(),
            cursor_param: "cursor".to_string(),
        }
    }
}

/// One decoded page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next: Option<String>,
}

impl PageLayout {
    pub fn parse(&self, body: &str) -> Result<Page, AppError> {
        let mut envelope: Value = serde_json::from_str(body)?;

        let items = match envelope.get_mut(&self.items_field).map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(AppError::ParseError(format!(
                    "Field '{}' is not an array: {other}",
                    self.items_field
                )));
            }
            None => {
                return Err(AppError::ParseError(format!(
                    "Page is missing field '{}'",
                    self.items_field
                )));
            }
        };

        let next = match envelope.get(&self.next_field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Page { items, next })
    }
}

/// Builder for a paginated item stream.
pub struct PaginatedRetriever<T: Transport> {
    client: ApiClient<T>,
    endpoint: String,
    params: BTreeMap<String, String>,
    layout: PageLayout,
    limit: Option<usize>,
    retry: RetryConfig,
    backpressure: BackpressureConfig,
    memory: Arc<dyn MemoryProbe>,
}

impl<T: Transport> PaginatedRetriever<T> {
    pub fn new(client: ApiClient<T>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            layout: PageLayout::default(),
            limit: None,
            retry: RetryConfig::default(),
            backpressure: BackpressureConfig::default(),
            memory: Arc::new(ProcessMemoryProbe::new()),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_layout(mut self, layout: PageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Stop after yielding `limit` items.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_backpressure(
        mut self,
        config: BackpressureConfig,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        self.backpressure = config;
        self.memory = memory;
        self
    }

    /// Consume the builder into a stream of items.
    ///
    /// The stream yields at most one error, after which it ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, AppError>> + Send + 'static {
        futures::stream::unfold(
            (self, StreamState::default()),
            |(retriever, mut state)| async move {
                let item = retriever.next_item(&mut state).await?;
                Some((item, (retriever, state)))
            },
        )
    }

    async fn next_item(&self, state: &mut StreamState) -> Option<Result<Value, AppError>> {
        loop {
            if self.limit.is_some_and(|limit| state.yielded >= limit) || state.finished {
                return None;
            }

            if let Some(item) = state.buffer.pop_front() {
                state.yielded += 1;
                return Some(Ok(item));
            }

            if state.pages > 0 && state.cursor.is_none() {
                return None;
            }

            let waits = self.backpressure.wait_for_headroom(&self.memory).await;
            if waits > 0 {
                tracing::debug!(endpoint = %self.endpoint, waits, "Resumed after backpressure");
            }

            match self.fetch_page(state.cursor.as_deref()).await {
                Ok(page) => {
                    state.pages += 1;
                    if page.next.is_some() && page.next == state.cursor {
                        tracing::warn!(
                            endpoint = %self.endpoint,
                            cursor = ?page.next,
                            "Remote repeated the same cursor, ending listing"
                        );
                        state.cursor = None;
                    } else {
                        state.cursor = page.next;
                    }
                    state.buffer.extend(page.items);
                }
                Err(e) => {
                    state.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Fetch one page, retrying transient failures.
    ///
    /// The call runs on its own task, so if the stream is dropped while a
    /// page is in flight the call still completes and its result is dropped.
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Page, AppError> {
        let mut params = self.params.clone();
        if let Some(cursor) = cursor {
            params.insert(self.layout.cursor_param.clone(), cursor.to_string());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let client = self.client.clone();
            let endpoint = self.endpoint.clone();
            let call_params = params.clone();
            let layout = self.layout.clone();
            let handle = tokio::spawn(async move {
                client
                    .get_parsed(PAGE_OPERATION, &endpoint, &call_params, |body| {
                        layout.parse(body)
                    })
                    .await
            });

            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(AppError::Generic(format!("Page task failed: {e}"))),
            };

            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt, &e);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Default)]
struct StreamState {
    buffer: VecDeque<Value>,
    cursor: Option<String>,
    pages: usize,
    yielded: usize,
    finished: bool,
}
