//! The gated call path shared by every remote request.
//!
//! - Cached reads (pages, item metadata): RateGovernor → ResponseCache →
//!   CircuitBreaker → Transport
//! - Uncached calls (artifact downloads): CircuitBreaker → RateGovernor →
//!   Transport
//!
//! Every network call carries an overall timeout; a timeout surfaces as
//! [`AppError::Timeout`] and counts as a transient failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheKey, ResponseCache};
use crate::circuit_breaker::CircuitRegistry;
use crate::error::AppError;
use crate::governor::RateGovernor;
use crate::models::{ApiRequest, ApiResponse};
use crate::traits::Transport;

/// Circuit name for paginated listing calls.
pub const PAGE_OPERATION: &str = "page";
/// Circuit name for single-item metadata calls.
pub const ITEM_OPERATION: &str = "item";
/// Circuit name for artifact downloads.
pub const DOWNLOAD_OPERATION: &str = "download";

const ERROR_BODY_EXCERPT: usize = 200;

/// Turn a raw reply into success or a classified error.
///
/// A 429, or a 403/503 that carries `Retry-After` or
/// `X-RateLimit-Remaining: 0`, is a rate-limit signal. Other 5xx and 408
/// are transient. Everything else outside 2xx is permanent.
pub fn classify_response(response: ApiResponse) -> Result<ApiResponse, AppError> {
    if response.is_success() {
        return Ok(response);
    }

    let status = response.status;
    let exhausted_quota = response
        .header("x-ratelimit-remaining")
        .is_some_and(|v| v.trim() == "0");
    let has_retry_after = response.header("retry-after").is_some();

    if status == 429 || (matches!(status, 403 | 503) && (exhausted_quota || has_retry_after)) {
        return Err(AppError::RateLimited {
            retry_after: response.retry_after(),
        });
    }

    let mut message = response.body_text();
    if message.len() > ERROR_BODY_EXCERPT {
        let mut cut = ERROR_BODY_EXCERPT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    if status == 408 || (500..600).contains(&status) {
        Err(AppError::RemoteError { status, message })
    } else {
        Err(AppError::PermanentFailure {
            status: Some(status),
            message,
        })
    }
}

/// Client for one logical remote endpoint.
///
/// Cheap to clone: the governor, cache and circuits are shared.
#[derive(Clone)]
pub struct ApiClient<T: Transport> {
    transport: T,
    governor: Arc<RateGovernor>,
    cache: Arc<ResponseCache>,
    circuits: CircuitRegistry,
    request_timeout: Duration,
}

impl<T: Transport> ApiClient<T> {
    pub fn new(
        transport: T,
        governor: Arc<RateGovernor>,
        cache: Arc<ResponseCache>,
        circuits: CircuitRegistry,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            governor,
            cache,
            circuits,
            request_timeout,
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// Cached GET decoded by `parse`. A body `parse` rejects is never
    /// cached.
    pub async fn get_parsed<R, F>(
        &self,
        operation: &str,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        parse: F,
    ) -> Result<R, AppError>
    where
        F: FnOnce(&str) -> Result<R, AppError>,
    {
        self.governor.wait().await;

        let key = CacheKey::derive(endpoint, params);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(%endpoint, "Cache hit");
            return parse(&*hit);
        }

        let request = ApiRequest::get(endpoint).with_params(params);
        let breaker = self.circuits.get(operation);
        let response = breaker
            .call(|| self.send(&request))
            .await
            .map_err(AppError::from);
        let response = self.observe(response)?;

        let body = String::from_utf8(response.body)
            .map_err(|e| AppError::ParseError(format!("Response body is not UTF-8: {e}")))?;
        let parsed = parse(body.as_str())?;
        self.cache.insert(key, Arc::from(body));
        Ok(parsed)
    }

    /// Cached GET parsed as JSON.
    pub async fn get_json(
        &self,
        operation: &str,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, AppError> {
        self.get_parsed(operation, endpoint, params, |body| {
            Ok(serde_json::from_str(body)?)
        })
        .await
    }

    /// Uncached call. The circuit is checked before a rate slot is taken.
    pub async fn fetch(&self, operation: &str, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        let breaker = self.circuits.get(operation);
        let response = breaker
            .call(|| async {
                self.governor.wait().await;
                self.send(request).await
            })
            .await
            .map_err(AppError::from);
        self.observe(response)
    }

    /// Download an artifact, asking the remote to resume at `offset`.
    pub async fn download(&self, locator: &str, offset: u64) -> Result<ApiResponse, AppError> {
        let mut request = ApiRequest::get(locator);
        if offset > 0 {
            request = request.with_header("Range", format!("bytes={offset}-"));
        }
        self.fetch(DOWNLOAD_OPERATION, &request).await
    }

    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        let response = tokio::time::timeout(self.request_timeout, self.transport.request(request))
            .await
            .map_err(|_| AppError::Timeout(self.request_timeout))??;
        classify_response(response)
    }

    /// Feed the outcome back into the rate governor.
    fn observe(
        &self,
        result: Result<ApiResponse, AppError>,
    ) -> Result<ApiResponse, AppError> {
        match &result {
            Ok(_) => self.governor.record_success(),
            Err(AppError::RateLimited { .. }) => self.governor.record_rate_limited(),
            Err(_) => {}
        }
        result
    }
}
