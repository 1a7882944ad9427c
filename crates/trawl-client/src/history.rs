use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use trawl_core::cache::CacheSnapshot;
use trawl_core::error::AppError;
use trawl_core::job::JobHistoryRecord;
use trawl_core::traits::HistoryStore;

const JOBS_FILE: &str = "jobs.jsonl";
const CACHE_FILE: &str = "cache.json";

/// History store backed by a directory of JSON files.
///
/// - `jobs.jsonl`: one [`JobHistoryRecord`] per line, appended
/// - `cache.json`: the latest [`CacheSnapshot`], replaced atomically
#[derive(Debug, Clone)]
pub struct JsonFileHistory {
    dir: PathBuf,
}

impl JsonFileHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every recorded job, oldest first. Unreadable lines are skipped.
    pub async fn jobs(&self) -> Result<Vec<JobHistoryRecord>, AppError> {
        let path = self.dir.join(JOBS_FILE);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::from_io(&format!("read {}", path.display()), e)),
        };

        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed job history line");
                    None
                }
            })
            .collect())
    }

    async fn ensure_dir(&self) -> Result<(), AppError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::from_io(&format!("create {}", self.dir.display()), e))
    }
}

impl HistoryStore for JsonFileHistory {
    async fn record_job(&self, record: &JobHistoryRecord) -> Result<(), AppError> {
        self.ensure_dir().await?;
        let path = self.dir.join(JOBS_FILE);
        let context = format!("append {}", path.display());

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::from_io(&context, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| AppError::from_io(&context, e))?;
        file.flush()
            .await
            .map_err(|e| AppError::from_io(&context, e))
    }

    async fn save_cache(&self, snapshot: &CacheSnapshot) -> Result<(), AppError> {
        self.ensure_dir().await?;
        let path = self.dir.join(CACHE_FILE);
        let tmp = self.dir.join(format!("{CACHE_FILE}.tmp"));

        let body = serde_json::to_vec(snapshot)?;
        fs::write(&tmp, body)
            .await
            .map_err(|e| AppError::from_io(&format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::from_io(&format!("replace {}", path.display()), e))
    }

    async fn load_cache(&self) -> Result<Option<CacheSnapshot>, AppError> {
        let path = self.dir.join(CACHE_FILE);
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::from_io(&format!("read {}", path.display()), e)),
        }
    }
}
