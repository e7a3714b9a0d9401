//! Durable per-credential rolling 24h byte counter (C1).
//!
//! One `DashMap` entry per key, mutated under the shard lock `DashMap`
//! gives for free, with the file write happening after the lock is
//! released (spec.md §4.1's "write-behind" clause).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::persistence::{self, PersistError};

const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from [`QuotaLedger`] construction. `add`/`remaining`/`eligible`/
/// `sweep` never return `Result` (spec.md §7: "never propagate").
#[derive(Debug, Error)]
pub enum QuotaError {
    /// The on-disk cache file exists but could not be read or parsed.
    #[error("failed to load quota cache {path}: {source}")]
    Load {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying persistence error.
        #[source]
        source: PersistError,
    },
}

/// One quota record per `(uploader, credential)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Bytes accounted in the current window.
    pub bytes_used: u64,
    /// Start of the current 24h window.
    pub window_start: SystemTime,
    /// When this credential was first used, ever.
    pub first_upload_at: SystemTime,
}

impl QuotaRecord {
    fn fresh(now: SystemTime) -> Self {
        Self {
            bytes_used: 0,
            window_start: now,
            first_upload_at: now,
        }
    }

    /// The instant this record's window lapses and its usage lazily
    /// resets to zero (spec.md §3: "derived field, avoids a skew bug").
    #[must_use]
    pub fn reset_at(&self) -> SystemTime {
        self.window_start + WINDOW
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.reset_at()
    }
}

/// Durable quota tracker, keyed by `(uploader, credential)` string pairs.
///
/// Safe under concurrent calls from the engine driver's event reader and
/// the session loop, per spec.md §4.1.
pub struct QuotaLedger {
    records: DashMap<(String, String), QuotaRecord>,
    cache_path: PathBuf,
    quota_cap_bytes: u64,
    safety_margin_bytes: u64,
}

impl QuotaLedger {
    /// Loads the ledger from `cache_path`, treating a missing or corrupt
    /// file as an empty ledger (spec.md §7 item 6).
    #[must_use]
    pub fn load(cache_path: PathBuf, quota_cap_bytes: u64, safety_margin_bytes: u64) -> Self {
        let records: DashMap<(String, String), QuotaRecord> =
            persistence::load_or_empty::<Vec<((String, String), QuotaRecord)>>(&cache_path)
                .map(DashMap::from_iter)
                .unwrap_or_default();

        Self {
            records,
            cache_path,
            quota_cap_bytes,
            safety_margin_bytes,
        }
    }

    /// Accounts `bytes` against `(uploader, credential)`'s current window.
    ///
    /// Creates the record on first use. The in-memory mutation happens
    /// under the `DashMap` shard lock; the persisted snapshot is written
    /// after releasing it, so the in-memory state is authoritative even
    /// if the write fails (spec.md §7 item 6).
    #[instrument(skip(self), fields(uploader, credential, bytes))]
    pub fn add(&self, uploader: &str, credential: &str, bytes: u64) {
        let now = SystemTime::now();
        let key = (uploader.to_string(), credential.to_string());

        self.records
            .entry(key)
            .and_modify(|record| {
                if record.is_expired(now) {
                    *record = QuotaRecord::fresh(now);
                }
                record.bytes_used = record.bytes_used.saturating_add(bytes);
            })
            .or_insert_with(|| {
                let mut record = QuotaRecord::fresh(now);
                record.bytes_used = bytes;
                record
            });

        self.persist();
    }

    /// Remaining eligible bytes for `(uploader, credential)` this window.
    #[must_use]
    pub fn remaining(&self, uploader: &str, credential: &str) -> u64 {
        let now = SystemTime::now();
        let key = (uploader.to_string(), credential.to_string());
        let used = self
            .records
            .get(&key)
            .map(|record| if record.is_expired(now) { 0 } else { record.bytes_used })
            .unwrap_or(0);
        self.quota_cap_bytes.saturating_sub(used)
    }

    /// Whether `(uploader, credential)` has headroom under the safety
    /// margin (spec.md §3).
    #[must_use]
    pub fn eligible(&self, uploader: &str, credential: &str) -> bool {
        self.remaining(uploader, credential) > self.safety_margin_bytes
    }

    /// Expires any record past its window and returns the cleared keys.
    ///
    /// Idempotent: a record already logically expired but not yet swept
    /// is swept exactly once, then absent from subsequent calls until it
    /// accrues new usage.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> Vec<(String, String)> {
        let now = SystemTime::now();
        let expired: Vec<(String, String)> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.records.remove(key);
        }

        if !expired.is_empty() {
            self.persist();
        }
        expired
    }

    fn persist(&self) {
        let snapshot: Vec<((String, String), QuotaRecord)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        if let Err(err) = persistence::write_atomic(&self.cache_path, &snapshot) {
            persistence::log_persist_failure(&err);
        }
    }
}

/// Default cache file name under the configured state directory
/// (spec.md §6).
#[must_use]
pub fn default_cache_path(state_dir: &Path) -> PathBuf {
    state_dir.join("sa_quota_cache.json")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ledger_in(dir: &Path) -> QuotaLedger {
        QuotaLedger::load(default_cache_path(dir), 100, 5)
    }

    #[test]
    fn test_add_accumulates_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        ledger.add("uploader-a", "cred-1", 10);
        ledger.add("uploader-a", "cred-1", 20);
        assert_eq!(ledger.remaining("uploader-a", "cred-1"), 70);
    }

    #[test]
    fn test_remaining_never_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        ledger.add("uploader-a", "cred-1", 1000);
        assert_eq!(ledger.remaining("uploader-a", "cred-1"), 0);
    }

    #[test]
    fn test_eligible_respects_safety_margin() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        ledger.add("uploader-a", "cred-1", 96);
        assert!(!ledger.eligible("uploader-a", "cred-1"));
    }

    #[test]
    fn test_unknown_credential_is_fully_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        assert!(ledger.eligible("uploader-a", "cred-unused"));
        assert_eq!(ledger.remaining("uploader-a", "cred-unused"), 100);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_in(dir.path());
        ledger.add("uploader-a", "cred-1", 10);
        // Force expiry by rewinding the window manually.
        ledger
            .records
            .alter(&("uploader-a".to_string(), "cred-1".to_string()), |_, mut record| {
                record.window_start = SystemTime::now() - Duration::from_secs(25 * 60 * 60);
                record
            });

        let first = ledger.sweep();
        let second = ledger.sweep();
        assert_eq!(first, vec![("uploader-a".to_string(), "cred-1".to_string())]);
        assert!(second.is_empty());
    }

    #[test]
    fn test_persisted_cache_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = ledger_in(dir.path());
            ledger.add("uploader-a", "cred-1", 42);
        }
        let reloaded = ledger_in(dir.path());
        assert_eq!(reloaded.remaining("uploader-a", "cred-1"), 58);
    }
}
