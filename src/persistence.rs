//! Atomic write-behind persistence shared by the four on-disk caches
//! (quota, ban, learned-size, session-state).
//!
//! Every persisted cache in this crate is a single JSON file with exactly
//! one writer. Writes never mutate the file in place: the new content is
//! written to a sibling temp file and renamed over the target, so a
//! reader never observes a torn write (spec.md §5, §9).

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from atomic cache persistence.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Serialization to JSON failed.
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Writing the temp file or renaming it failed.
    #[error("failed to write cache file {path}: {source}")]
    Io {
        /// Target path that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
///
/// Writes to `{path}.tmp.{pid}` first, then renames. The rename is atomic
/// on POSIX and on Windows (same-volume renames replace the destination).
/// Per spec.md §7 item 6, a write failure here is logged and the
/// in-memory state remains authoritative; callers do not abort on
/// [`PersistError`], they log it via [`log_persist_failure`].
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let json = serde_json::to_string_pretty(value)?;

    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, json).map_err(|source| PersistError::Io {
        path: tmp_path.clone(),
        source,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), "persisted cache");
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    path.with_file_name(format!("{file_name}.tmp.{pid}"))
}

/// Loads and deserializes a JSON cache file.
///
/// Per spec.md §7 item 6, a missing or unreadable file is treated as an
/// empty cache rather than a hard error: returns `Ok(None)` when the file
/// does not exist, and logs + returns `Ok(None)` when it exists but fails
/// to parse (a corrupted cache should not block startup).
pub fn load_or_empty<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read cache file, treating as empty");
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to parse cache file, treating as empty");
            None
        }
    }
}

/// Logs a persistence failure without propagating it (spec.md §7 item 6).
pub fn log_persist_failure(err: &PersistError) {
    warn!(error = %err, "cache write failed; in-memory state remains authoritative");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn test_write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        write_atomic(&path, &Sample { value: 42 }).unwrap();
        let loaded: Sample = load_or_empty(&path).unwrap();
        assert_eq!(loaded, Sample { value: 42 });
    }

    #[test]
    fn test_load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Option<Sample> = load_or_empty(&path);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_corrupted_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded: Option<Sample> = load_or_empty(&path);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_write_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        write_atomic(&path, &Sample { value: 1 }).unwrap();

        let tmp = tmp_path_for(&path);
        assert!(!tmp.exists());
        assert!(path.exists());
    }

    #[test]
    fn test_write_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        write_atomic(&path, &Sample { value: 1 }).unwrap();
        write_atomic(&path, &Sample { value: 2 }).unwrap();

        let loaded: Sample = load_or_empty(&path).unwrap();
        assert_eq!(loaded, Sample { value: 2 });
    }
}
