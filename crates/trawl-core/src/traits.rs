use std::future::Future;
use std::path::Path;

use crate::cache::CacheSnapshot;
use crate::error::AppError;
use crate::job::JobHistoryRecord;
use crate::models::{ApiRequest, ApiResponse};

/// Performs raw requests against the remote content API.
///
/// Implementations report connection and timeout failures as
/// [`AppError::NetworkError`] / [`AppError::Timeout`] and return every
/// HTTP reply (including non-2xx) as an [`ApiResponse`].
pub trait Transport: Send + Sync + Clone + 'static {
    fn request(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, AppError>> + Send;
}

/// Resume-capable writer for downloaded artifacts.
///
/// Data is staged at a temporary location derived from `dest` and only
/// appears at `dest` after [`commit`](Self::commit).
pub trait ArtifactSink: Send + Sync + Clone + 'static {
    /// Prepare a write for `dest`. Returns the number of bytes already
    /// staged from a previous attempt (the resume offset).
    fn begin(
        &self,
        dest: &Path,
        expected_size: Option<u64>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Append `data` to the staged file at `offset`. An offset of zero
    /// truncates whatever was staged before.
    fn append(
        &self,
        dest: &Path,
        offset: u64,
        data: &[u8],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Move the staged file to `dest`.
    fn commit(&self, dest: &Path) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Remove any staged data for `dest`.
    fn discard(&self, dest: &Path) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Data-layer collaborator for job history and cache snapshots.
pub trait HistoryStore: Send + Sync + Clone + 'static {
    fn record_job(
        &self,
        record: &JobHistoryRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn save_cache(
        &self,
        snapshot: &CacheSnapshot,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn load_cache(&self) -> impl Future<Output = Result<Option<CacheSnapshot>, AppError>> + Send;
}

/// A no-op HistoryStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullHistory;

impl HistoryStore for NullHistory {
    async fn record_job(&self, _record: &JobHistoryRecord) -> Result<(), AppError> {
        Ok(())
    }

    async fn save_cache(&self, _snapshot: &CacheSnapshot) -> Result<(), AppError> {
        Ok(())
    }

    async fn load_cache(&self) -> Result<Option<CacheSnapshot>, AppError> {
        Ok(None)
    }
}
