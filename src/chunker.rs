//! Optional pre-partitioning of a work listing into fixed-count batches
//! (C4).
//!
//! Batching an ordered listing rather than a SQL-backed item queue.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

/// Errors materializing or cleaning up chunk artifacts.
#[derive(Debug, Error)]
pub enum ChunkerError {
    /// Writing a batch artifact file failed.
    #[error("failed to write chunk artifact {path}: {source}")]
    Write {
        /// Path that failed to write.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// An ordered partition of a file listing into batches of at most
/// `chunk_size` names (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    batches: Vec<Vec<String>>,
    materialized: Vec<PathBuf>,
}

impl ChunkPlan {
    /// Partitions `listing` into `⌈N/chunk_size⌉` ordered batches,
    /// preserving the engine's listing order (spec.md §4.4 invariant:
    /// each source file appears in exactly one batch).
    #[must_use]
    pub fn plan(listing: Vec<String>, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        let batches = listing
            .chunks(chunk_size)
            .map(<[String]>::to_vec)
            .collect();
        Self {
            batches,
            materialized: Vec::new(),
        }
    }

    /// Number of batches in this plan.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// The file names assigned to `index`.
    #[must_use]
    pub fn batch(&self, index: usize) -> &[String] {
        &self.batches[index]
    }

    /// Writes batch `index` as a newline-delimited file-list artifact
    /// under `dir`, returning its path. The path is unique per batch and
    /// tracked for [`ChunkPlan::cleanup`].
    ///
    /// # Errors
    ///
    /// Returns [`ChunkerError::Write`] if the artifact cannot be written.
    #[instrument(skip(self, dir))]
    pub fn materialize_batch(&mut self, dir: &Path, index: usize) -> Result<PathBuf, ChunkerError> {
        let path = dir.join(format!("chunk-{index}.list"));
        let contents = self.batches[index].join("\n");
        std::fs::write(&path, contents).map_err(|source| ChunkerError::Write {
            path: path.clone(),
            source,
        })?;
        self.materialized.push(path.clone());
        Ok(path)
    }

    /// Removes every artifact written by [`ChunkPlan::materialize_batch`].
    ///
    /// Called from the session loop's stage-exit path regardless of
    /// outcome (success, failure, or abort), per spec.md §4.4. Each
    /// removal is best-effort: a missing file is not an error (it may
    /// already have been cleaned up on a prior crash-recovery pass).
    pub fn cleanup(&mut self) {
        for path in self.materialized.drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove chunk artifact");
                }
            }
        }
    }
}

impl Drop for ChunkPlan {
    fn drop(&mut self) {
        if !self.materialized.is_empty() {
            self.cleanup();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn listing(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("file-{i}.bin")).collect()
    }

    #[test]
    fn test_plan_partitions_preserve_order_and_coverage() {
        let plan = ChunkPlan::plan(listing(25), 10);
        assert_eq!(plan.batch_count(), 3);
        assert_eq!(plan.batch(0).len(), 10);
        assert_eq!(plan.batch(1).len(), 10);
        assert_eq!(plan.batch(2).len(), 5);

        let union: Vec<&String> = (0..plan.batch_count())
            .flat_map(|i| plan.batch(i))
            .collect();
        let expected = listing(25);
        assert_eq!(union, expected.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_plan_batches_are_disjoint() {
        let plan = ChunkPlan::plan(listing(17), 5);
        let mut seen = std::collections::HashSet::new();
        for i in 0..plan.batch_count() {
            for name in plan.batch(i) {
                assert!(seen.insert(name.clone()), "duplicate across batches: {name}");
            }
        }
    }

    #[test]
    fn test_materialize_then_cleanup_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = ChunkPlan::plan(listing(5), 2);
        let path0 = plan.materialize_batch(dir.path(), 0).unwrap();
        let path1 = plan.materialize_batch(dir.path(), 1).unwrap();
        assert!(path0.exists());
        assert!(path1.exists());

        plan.cleanup();
        assert!(!path0.exists());
        assert!(!path1.exists());
    }

    #[test]
    fn test_cleanup_is_safe_to_call_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = ChunkPlan::plan(listing(3), 3);
        plan.materialize_batch(dir.path(), 0).unwrap();
        plan.cleanup();
        plan.cleanup();
    }

    #[test]
    fn test_drop_cleans_up_without_explicit_call() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut plan = ChunkPlan::plan(listing(2), 2);
            path = plan.materialize_batch(dir.path(), 0).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

}
