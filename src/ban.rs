//! Durable set of currently-suspended credentials (C2).
//!
//! Kept synchronized with [`crate::quota::QuotaLedger`] per the
//! invariant in spec.md §4.2: `quota_expired(x) ⇒ ¬is_banned(x)`. The
//! caller (the session loop, C8) is responsible for the ordering that
//! makes this hold — see [`BanSet::clear_for_quota_expiry`].

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::persistence;

/// One ban record per `(uploader, credential)`. Absence from the set
/// means "not banned" (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BanRecord {
    /// When the ban lifts.
    pub unban_at: SystemTime,
}

/// Durable ban tracker, keyed by `(uploader, credential)` string pairs.
pub struct BanSet {
    records: DashMap<(String, String), BanRecord>,
    cache_path: PathBuf,
}

impl BanSet {
    /// Loads the ban set from `cache_path`, treating a missing or
    /// corrupt file as an empty set.
    #[must_use]
    pub fn load(cache_path: PathBuf) -> Self {
        let records: DashMap<(String, String), BanRecord> =
            persistence::load_or_empty::<Vec<((String, String), BanRecord)>>(&cache_path)
                .map(DashMap::from_iter)
                .unwrap_or_default();
        Self { records, cache_path }
    }

    /// Bans `(uploader, credential)` until `until`.
    #[instrument(skip(self))]
    pub fn ban(&self, uploader: &str, credential: &str, until: SystemTime) {
        self.records.insert(
            (uploader.to_string(), credential.to_string()),
            BanRecord { unban_at: until },
        );
        self.persist();
    }

    /// Lifts any ban on `(uploader, credential)`, regardless of expiry.
    pub fn unban(&self, uploader: &str, credential: &str) {
        let key = (uploader.to_string(), credential.to_string());
        if self.records.remove(&key).is_some() {
            self.persist();
        }
    }

    /// Whether `(uploader, credential)` is currently banned.
    ///
    /// An expired-but-not-yet-refreshed record still counts as banned
    /// here by design: callers must call [`BanSet::refresh`] before
    /// credential selection, per spec.md §4.2 ("`refresh` is called
    /// before credential selection, not after").
    #[must_use]
    pub fn is_banned(&self, uploader: &str, credential: &str) -> bool {
        let key = (uploader.to_string(), credential.to_string());
        self.records
            .get(&key)
            .is_some_and(|record| record.unban_at > SystemTime::now())
    }

    /// Drops every record whose `unban_at` has passed and returns the
    /// just-unbanned keys.
    #[instrument(skip(self))]
    pub fn refresh(&self) -> Vec<(String, String)> {
        let now = SystemTime::now();
        let expired: Vec<(String, String)> = self
            .records
            .iter()
            .filter(|entry| entry.value().unban_at <= now)
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

    /// Clears bans for every key that [`crate::quota::QuotaLedger::sweep`]
    /// just reported as quota-expired, regardless of the ban's own
    /// `unban_at`. This is the half of the synchronization invariant
    /// that quota expiry drives: the session loop calls this
    /// immediately after `sweep`, before calling [`BanSet::refresh`] or
    /// making any selection decision (spec.md §4.2).
    #[instrument(skip(self, expired_quota_keys))]
    pub fn clear_for_quota_expiry(&self, expired_quota_keys: &[(String, String)]) {
        let mut changed = false;
        for key in expired_quota_keys {
            if self.records.remove(key).is_some() {
                changed = true;
            }
        }
        if changed {
            self.persist();
        }
    }

    fn persist(&self) {
        let snapshot: Vec<((String, String), BanRecord)> = self
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
    state_dir.join("ban_cache.json")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ban_then_is_banned() {
        let dir = tempfile::tempdir().unwrap();
        let set = BanSet::load(default_cache_path(dir.path()));
        set.ban("uploader-a", "cred-1", SystemTime::now() + Duration::from_secs(3600));
        assert!(set.is_banned("uploader-a", "cred-1"));
    }

    #[test]
    fn test_unban_clears_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let set = BanSet::load(default_cache_path(dir.path()));
        set.ban("uploader-a", "cred-1", SystemTime::now() + Duration::from_secs(3600));
        set.unban("uploader-a", "cred-1");
        assert!(!set.is_banned("uploader-a", "cred-1"));
    }

    #[test]
    fn test_refresh_drops_expired_and_returns_keys() {
        let dir = tempfile::tempdir().unwrap();
        let set = BanSet::load(default_cache_path(dir.path()));
        set.ban("uploader-a", "cred-1", SystemTime::now() - Duration::from_secs(1));
        let unbanned = set.refresh();
        assert_eq!(unbanned, vec![("uploader-a".to_string(), "cred-1".to_string())]);
        assert!(!set.is_banned("uploader-a", "cred-1"));
    }

    #[test]
    fn test_clear_for_quota_expiry_ignores_unban_at() {
        let dir = tempfile::tempdir().unwrap();
        let set = BanSet::load(default_cache_path(dir.path()));
        // Banned far into the future, but quota already expired.
        set.ban("uploader-a", "cred-1", SystemTime::now() + Duration::from_secs(86_400));
        set.clear_for_quota_expiry(&[("uploader-a".to_string(), "cred-1".to_string())]);
        assert!(!set.is_banned("uploader-a", "cred-1"));
    }

    #[test]
    fn test_quota_expiry_then_refresh_invariant() {
        // spec.md P2: quota_expired(x) => !is_banned(x), observed before
        // the next credential-selection call.
        let dir = tempfile::tempdir().unwrap();
        let set = BanSet::load(default_cache_path(dir.path()));
        set.ban("uploader-a", "cred-1", SystemTime::now() + Duration::from_secs(86_400));

        let swept_quota_keys = vec![("uploader-a".to_string(), "cred-1".to_string())];
        set.clear_for_quota_expiry(&swept_quota_keys);
        set.refresh();

        assert!(!set.is_banned("uploader-a", "cred-1"));
    }

    #[test]
    fn test_persisted_ban_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let set = BanSet::load(default_cache_path(dir.path()));
            set.ban("uploader-a", "cred-1", SystemTime::now() + Duration::from_secs(3600));
        }
        let reloaded = BanSet::load(default_cache_path(dir.path()));
        assert!(reloaded.is_banned("uploader-a", "cred-1"));
    }
}
