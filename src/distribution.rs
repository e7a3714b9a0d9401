//! Reservoir-sampled histogram of observed file sizes (C3).
//!
//! The reservoir itself uses Algorithm R, a `rand`-driven technique,
//! for uniform sampling over an unbounded stream.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::persistence;

/// Default reservoir capacity (spec.md §4.3).
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 10_000;

/// Size bucket boundaries in bytes, per spec.md §3.
const BUCKET_BOUNDS_BYTES: [u64; 4] = [
    100 * 1024 * 1024,           // 100 MB
    1024 * 1024 * 1024,          // 1 GB
    10 * 1024 * 1024 * 1024,     // 10 GB
    50 * 1024 * 1024 * 1024,     // 50 GB
];

/// Which feed populates a [`DistributionTracker`] (spec.md §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionSource {
    /// Fed from the control-plane's checking/transferring arrays before
    /// transfer begins. The only variant C7 reads.
    CheckerQueue,
    /// Fed from completed-transfer events. Analytic only.
    CompletedTransfers,
}

/// Confidence in a snapshot, keyed by sample-count thresholds
/// (spec.md §3: "10/100/1000").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    /// Fewer than 10 samples.
    Low,
    /// 10 to 99 samples.
    Medium,
    /// 100 to 999 samples.
    High,
    /// 1000 or more samples.
    VeryHigh,
}

impl Confidence {
    fn from_count(count: usize) -> Self {
        match count {
            0..=9 => Confidence::Low,
            10..=99 => Confidence::Medium,
            100..=999 => Confidence::High,
            _ => Confidence::VeryHigh,
        }
    }
}

/// A point-in-time summary of a [`DistributionTracker`]'s reservoir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSnapshot {
    /// Total number of samples ever observed (not reservoir size).
    pub count: u64,
    /// Sum of all observed sizes, in bytes.
    pub total_bytes: u128,
    /// 50th percentile size, in bytes.
    pub p50: u64,
    /// 75th percentile size, in bytes.
    pub p75: u64,
    /// 90th percentile size, in bytes.
    pub p90: u64,
    /// 95th percentile size, in bytes.
    pub p95: u64,
    /// 99th percentile size, in bytes.
    pub p99: u64,
    /// Count of samples in each of the five spec.md §3 buckets.
    pub size_buckets: [u64; 5],
    /// Share of 50 GB+ files by count.
    pub large_file_fraction: f64,
    /// Confidence derived from `count`.
    pub confidence: Confidence,
    /// Which feed produced this snapshot.
    pub source: DistributionSource,
    /// When this snapshot was computed.
    pub captured_at: SystemTime,
}

/// Reservoir-sampled size tracker. One instance per `(uploader, source)`.
pub struct DistributionTracker {
    source: DistributionSource,
    capacity: usize,
    state: Mutex<ReservoirState>,
}

struct ReservoirState {
    reservoir: Vec<u64>,
    total_seen: u64,
    total_bytes: u128,
    bucket_counts: [u64; 5],
}

impl DistributionTracker {
    /// Creates an empty tracker with the default reservoir capacity.
    #[must_use]
    pub fn new(source: DistributionSource) -> Self {
        Self::with_capacity(source, DEFAULT_RESERVOIR_CAPACITY)
    }

    /// Creates an empty tracker with an explicit reservoir capacity
    /// (used by tests to exercise eviction without 10,000 samples).
    #[must_use]
    pub fn with_capacity(source: DistributionSource, capacity: usize) -> Self {
        Self {
            source,
            capacity,
            state: Mutex::new(ReservoirState {
                reservoir: Vec::with_capacity(capacity.min(1024)),
                total_seen: 0,
                total_bytes: 0,
                bucket_counts: [0; 5],
            }),
        }
    }

    /// Records one observed file size. O(1) expected.
    pub fn observe(&self, size: u64) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.total_seen += 1;
        state.total_bytes += u128::from(size);
        let bucket = bucket_index(size);
        state.bucket_counts[bucket] += 1;

        if state.reservoir.len() < self.capacity {
            state.reservoir.push(size);
        } else {
            let index = rand::thread_rng().gen_range(0..state.total_seen as usize);
            if index < self.capacity {
                state.reservoir[index] = size;
            }
        }
    }

    /// Computes percentiles and bucket shares from the current
    /// reservoir. `count` reflects the true total observed, not the
    /// (possibly smaller) reservoir size.
    #[must_use]
    pub fn snapshot(&self) -> DistributionSnapshot {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        let mut sorted = state.reservoir.clone();
        sorted.sort_unstable();

        let percentile = |p: f64| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        let total_bucketed: u64 = state.bucket_counts.iter().sum();
        let large_file_fraction = if total_bucketed == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let fraction = state.bucket_counts[4] as f64 / total_bucketed as f64;
            fraction
        };

        DistributionSnapshot {
            count: state.total_seen,
            total_bytes: state.total_bytes,
            p50: percentile(0.50),
            p75: percentile(0.75),
            p90: percentile(0.90),
            p95: percentile(0.95),
            p99: percentile(0.99),
            size_buckets: state.bucket_counts,
            large_file_fraction,
            #[allow(clippy::cast_possible_truncation)]
            confidence: Confidence::from_count(state.total_seen as usize),
            source: self.source,
            captured_at: SystemTime::now(),
        }
    }
}

fn bucket_index(size: u64) -> usize {
    BUCKET_BOUNDS_BYTES
        .iter()
        .position(|&bound| size < bound)
        .unwrap_or(BUCKET_BOUNDS_BYTES.len())
}

/// Persisted snapshot pair for one uploader (spec.md §6:
/// `learned_sizes_cache.json` keyed `uploader -> {queue_distribution, transfer_history}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedSizesEntry {
    /// Last snapshot from the checker-queue tracker.
    pub queue_distribution: Option<DistributionSnapshot>,
    /// Last snapshot from the completed-transfers tracker.
    pub transfer_history: Option<DistributionSnapshot>,
}

/// Loads the per-uploader learned-sizes cache.
#[must_use]
pub fn load_cache(cache_path: &Path) -> std::collections::HashMap<String, LearnedSizesEntry> {
    persistence::load_or_empty(cache_path).unwrap_or_default()
}

/// Atomically persists the per-uploader learned-sizes cache.
pub fn persist_cache(
    cache_path: &Path,
    cache: &std::collections::HashMap<String, LearnedSizesEntry>,
) {
    if let Err(err) = persistence::write_atomic(cache_path, cache) {
        persistence::log_persist_failure(&err);
    }
}

/// Default cache file name under the configured state directory
/// (spec.md §6).
#[must_use]
pub fn default_cache_path(state_dir: &Path) -> PathBuf {
    state_dir.join("learned_sizes_cache.json")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_count_matches_observations() {
        let tracker = DistributionTracker::new(DistributionSource::CheckerQueue);
        for size in 1..=250u64 {
            tracker.observe(size * 1024 * 1024);
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.count, 250);
    }

    #[test]
    fn test_percentiles_are_monotonic() {
        let tracker = DistributionTracker::new(DistributionSource::CheckerQueue);
        for size in 1..=500u64 {
            tracker.observe(size * 1024 * 1024);
        }
        let snapshot = tracker.snapshot();
        assert!(snapshot.p50 <= snapshot.p75);
        assert!(snapshot.p75 <= snapshot.p90);
        assert!(snapshot.p90 <= snapshot.p95);
        assert!(snapshot.p95 <= snapshot.p99);
    }

    #[test]
    fn test_reservoir_caps_memory_but_not_count() {
        let tracker = DistributionTracker::with_capacity(DistributionSource::CheckerQueue, 16);
        for size in 1..=1000u64 {
            tracker.observe(size);
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.count, 1000);
    }

    #[test]
    fn test_confidence_thresholds() {
        assert_eq!(Confidence::from_count(5), Confidence::Low);
        assert_eq!(Confidence::from_count(10), Confidence::Medium);
        assert_eq!(Confidence::from_count(100), Confidence::High);
        assert_eq!(Confidence::from_count(1000), Confidence::VeryHigh);
    }

    #[test]
    fn test_large_file_fraction_counts_top_bucket_only() {
        let tracker = DistributionTracker::new(DistributionSource::CheckerQueue);
        for _ in 0..8 {
            tracker.observe(10 * 1024 * 1024); // bucket 0
        }
        for _ in 0..2 {
            tracker.observe(60 * 1024 * 1024 * 1024); // bucket 4 (50 GB+)
        }
        let snapshot = tracker.snapshot();
        assert!((snapshot.large_file_fraction - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_empty_tracker_snapshot_is_zeroed() {
        let tracker = DistributionTracker::new(DistributionSource::CheckerQueue);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.p99, 0);
        assert_eq!(snapshot.confidence, Confidence::Low);
    }
}
