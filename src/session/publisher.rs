//! Write-only session snapshot sink (C9).
//!
//! Every mutation atomically replaces the snapshot blob via
//! [`crate::persistence::write_atomic`] so an out-of-process reader
//! (a dashboard) never observes a torn state. The core never reads
//! this blob back — there is deliberately no `load`/`read` method on
//! [`SessionPublisher`]'s public API.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::persistence;

/// Snapshot of "what is happening now" for one uploader (spec.md §3).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Whether a session is actively running.
    pub active: bool,
    /// The uploader this snapshot describes.
    pub uploader: String,
    /// The credential currently in use, if any.
    pub current_credential: Option<String>,
    /// 1-based index of the current credential within the pool.
    pub credential_index: usize,
    /// Total credentials configured for this uploader.
    pub credential_total: usize,
    /// Current stage number within the current credential.
    pub stage: u32,
    /// When the session started.
    pub started_at: SystemTime,
    /// Credentials used so far this session, in order.
    pub credentials_used: Vec<String>,
}

/// Mirrors [`SessionSnapshot`] for test assertions only. The core
/// never reads the published file; this type exists purely so
/// integration tests can assert on what was written.
#[cfg(test)]
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionSnapshotView {
    pub active: bool,
    pub uploader: String,
    pub current_credential: Option<String>,
    pub credential_index: usize,
    pub credential_total: usize,
    pub stage: u32,
    pub credentials_used: Vec<String>,
}

/// Publishes [`SessionSnapshot`]s for one uploader.
pub struct SessionPublisher {
    path: PathBuf,
    state: SessionSnapshot,
}

impl SessionPublisher {
    /// Creates a publisher targeting `path`, not yet active.
    #[must_use]
    pub fn new(path: PathBuf, uploader: String) -> Self {
        Self {
            path,
            state: SessionSnapshot {
                active: false,
                uploader,
                current_credential: None,
                credential_index: 0,
                credential_total: 0,
                stage: 0,
                started_at: SystemTime::now(),
                credentials_used: Vec::new(),
            },
        }
    }

    /// Marks the session active and resets per-session counters.
    pub fn start_session(&mut self) {
        self.state.active = true;
        self.state.started_at = SystemTime::now();
        self.state.credentials_used.clear();
        self.publish();
    }

    /// Records the credential currently in use.
    pub fn update_credential(&mut self, index: usize, credential_id: &str, total: usize) {
        self.state.credential_index = index;
        self.state.current_credential = Some(credential_id.to_string());
        self.state.credential_total = total;
        self.state.stage = 0;
        if self.state.credentials_used.last().map(String::as_str) != Some(credential_id) {
            self.state.credentials_used.push(credential_id.to_string());
        }
        self.publish();
    }

    /// Records the current stage number.
    pub fn update_stage(&mut self, stage: u32) {
        self.state.stage = stage;
        self.publish();
    }

    /// Marks the session inactive.
    pub fn end_session(&mut self) {
        self.state.active = false;
        self.state.current_credential = None;
        self.publish();
    }

    fn publish(&self) {
        if let Err(err) = persistence::write_atomic(&self.path, &self.state) {
            persistence::log_persist_failure(&err);
        }
    }
}

/// Default cache file name under the configured state directory
/// (spec.md §6).
#[must_use]
pub fn default_snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join("session_state.json")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_start_session_marks_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        let mut publisher = SessionPublisher::new(path.clone(), "main".to_string());
        publisher.start_session();

        let raw = std::fs::read_to_string(&path).unwrap();
        let view: SessionSnapshotView = serde_json::from_str(&raw).unwrap();
        assert!(view.active);
        assert_eq!(view.uploader, "main");
    }

    #[test]
    fn test_update_credential_tracks_usage_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        let mut publisher = SessionPublisher::new(path.clone(), "main".to_string());
        publisher.start_session();
        publisher.update_credential(0, "sa1.json", 3);
        publisher.update_credential(1, "sa2.json", 3);

        let raw = std::fs::read_to_string(&path).unwrap();
        let view: SessionSnapshotView = serde_json::from_str(&raw).unwrap();
        assert_eq!(view.credentials_used, vec!["sa1.json", "sa2.json"]);
        assert_eq!(view.current_credential, Some("sa2.json".to_string()));
    }

    #[test]
    fn test_update_stage_resets_on_new_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        let mut publisher = SessionPublisher::new(path.clone(), "main".to_string());
        publisher.start_session();
        publisher.update_credential(0, "sa1.json", 1);
        publisher.update_stage(3);
        publisher.update_credential(1, "sa2.json", 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        let view: SessionSnapshotView = serde_json::from_str(&raw).unwrap();
        assert_eq!(view.stage, 0);
    }

    #[test]
    fn test_end_session_marks_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        let mut publisher = SessionPublisher::new(path.clone(), "main".to_string());
        publisher.start_session();
        publisher.end_session();

        let raw = std::fs::read_to_string(&path).unwrap();
        let view: SessionSnapshotView = serde_json::from_str(&raw).unwrap();
        assert!(!view.active);
        assert!(view.current_credential.is_none());
    }
}
