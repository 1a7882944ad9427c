use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use trawl_core::error::AppError;
use trawl_core::traits::ArtifactSink;

const STAGING_SUFFIX: &str = ".part";

/// Writes artifacts to the local file system.
///
/// Data is staged at `<dest>.part` and renamed onto `dest` on commit, so a
/// destination path only ever holds a complete artifact.
#[derive(Debug, Clone)]
pub struct FileSink {
    check_space: bool,
}

impl Default for FileSink {
    fn default() -> Self {
        Self { check_space: true }
    }
}

impl FileSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the free-space check on `begin`.
    pub fn without_space_check(mut self) -> Self {
        self.check_space = false;
        self
    }

    pub fn staging_path(dest: &Path) -> PathBuf {
        let mut name = OsString::from(dest.as_os_str());
        name.push(STAGING_SUFFIX);
        PathBuf::from(name)
    }
}

impl ArtifactSink for FileSink {
    async fn begin(&self, dest: &Path, expected_size: Option<u64>) -> Result<u64, AppError> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::from_io(&format!("create {}", parent.display()), e))?;
        }

        let staging = Self::staging_path(dest);
        let mut offset = match fs::metadata(&staging).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(AppError::from_io(&format!("stat {}", staging.display()), e)),
        };

        // Staged data longer than the announced size cannot be a prefix.
        if let Some(expected) = expected_size
            && offset > expected
        {
            tracing::debug!(path = %staging.display(), offset, expected, "Discarding oversized staged data");
            remove_if_exists(&staging).await?;
            offset = 0;
        }

        if self.check_space
            && let Some(expected) = expected_size
        {
            ensure_space(dest, expected.saturating_sub(offset)).await?;
        }

        Ok(offset)
    }

    async fn append(&self, dest: &Path, offset: u64, data: &[u8]) -> Result<(), AppError> {
        let staging = Self::staging_path(dest);
        let context = format!("write {}", staging.display());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(&staging)
            .await
            .map_err(|e| AppError::from_io(&context, e))?;

        if offset > 0 {
            file.set_len(offset)
                .await
                .map_err(|e| AppError::from_io(&context, e))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| AppError::from_io(&context, e))?;
        }
        file.write_all(data)
            .await
            .map_err(|e| AppError::from_io(&context, e))?;
        file.flush()
            .await
            .map_err(|e| AppError::from_io(&context, e))?;
        Ok(())
    }

    async fn commit(&self, dest: &Path) -> Result<(), AppError> {
        let staging = Self::staging_path(dest);
        fs::rename(&staging, dest)
            .await
            .map_err(|e| AppError::from_io(&format!("commit {}", dest.display()), e))
    }

    async fn discard(&self, dest: &Path) -> Result<(), AppError> {
        remove_if_exists(&Self::staging_path(dest)).await
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), AppError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::from_io(&format!("remove {}", path.display()), e)),
    }
}

/// Fail with `ResourceExhausted` when the disk holding `dest` cannot take
/// `needed` more bytes. Unknown mounts are not checked.
async fn ensure_space(dest: &Path, needed: u64) -> Result<(), AppError> {
    if needed == 0 {
        return Ok(());
    }
    let dir = dest.parent().unwrap_or(Path::new("."));
    let Ok(dir) = fs::canonicalize(dir).await else {
        return Ok(());
    };

    let available = tokio::task::spawn_blocking(move || {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    })
    .await
    .ok()
    .flatten();

    match available {
        Some(available) if available < needed => Err(AppError::ResourceExhausted(format!(
            "{} needs {needed} bytes, only {available} available",
            dest.display()
        ))),
        _ => Ok(()),
    }
}
