//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) for the
//! temp-directory housekeeping done by the resource monitor.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Delete regular files directly inside `dir`.
///
/// With `older_than`, only files whose modification time is at least that
/// old are removed. A missing directory counts as empty. Individual delete
/// failures are logged and skipped.
pub async fn remove_files_in(dir: &Path, older_than: Option<Duration>) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error("reading directory", dir, e)),
    };

    let now = SystemTime::now();
    let mut deleted = 0;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat temp file");
                continue;
            }
        };

        if let Some(max_age) = older_than {
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                debug!(path = %path.display(), "Deleted temp file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete temp file"),
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_all_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.part"), b"a").unwrap();
        std::fs::write(dir.path().join("b.part"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let deleted = remove_files_in(dir.path(), None).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_remove_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.part"), b"a").unwrap();

        let deleted = remove_files_in(dir.path(), Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.path().join("fresh.part").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert_eq!(remove_files_in(&missing, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ensure_dir_all() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir_all(&nested).await.unwrap();
        assert!(nested.is_dir());
    }
}
