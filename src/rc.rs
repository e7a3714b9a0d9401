//! Thin HTTP client for the engine's loopback control-plane API (C6).
//!
//! Every method here returns a plain value rather than `Result`: per
//! spec.md §7 item 4, control-plane failures "never abort" — they fall
//! back to an "unknown" value and are logged. There is no `RcError`
//! that escapes this module's public API at all.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::RcConfig;
use crate::engine::spawner::ProcessSpawner;
use crate::engine::EngineError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const NOOP_PROBE_ATTEMPTS: u32 = 10;
const NOOP_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// One in-flight or recently completed transfer, as reported by
/// `core/stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferringEntry {
    /// Remote-relative name of the file being transferred.
    pub name: String,
    /// Total size, in bytes.
    pub size: u64,
    /// Bytes transferred so far.
    pub bytes: u64,
    /// Current speed, in bytes/sec.
    pub speed: f64,
    /// Estimated seconds remaining.
    pub eta: Option<f64>,
}

/// A snapshot of `core/stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RcStats {
    /// Total bytes transferred so far this invocation.
    pub bytes: u64,
    /// Aggregate transfer speed, in bytes/sec.
    pub speed: f64,
    /// Estimated seconds remaining.
    pub eta: Option<f64>,
    /// Files currently transferring.
    #[serde(default)]
    pub transferring: Vec<TransferringEntry>,
    /// Names currently in the pre-transfer checking phase.
    #[serde(default)]
    pub checking: Vec<String>,
    /// Total bytes expected this invocation.
    #[serde(rename = "totalBytes", default)]
    pub total_bytes: u64,
    /// Whether this snapshot reflects a real response (`false` means
    /// the control-plane was unreachable and every other field is a
    /// zeroed placeholder).
    #[serde(skip, default = "default_known")]
    pub known: bool,
}

fn default_known() -> bool {
    true
}

impl RcStats {
    /// The "control-plane unreachable" placeholder (spec.md §7 item 4).
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            known: false,
            ..Self::default()
        }
    }

    /// Whether the early-termination condition holds (spec.md §4.5):
    /// no active transfers, zero aggregate speed, but still something
    /// in the checking queue.
    #[must_use]
    pub fn looks_idle_but_checking(&self) -> bool {
        self.known && self.transferring.is_empty() && self.speed == 0.0 && !self.checking.is_empty()
    }
}

/// Stateless HTTP client for the engine's control-plane.
pub struct RcClient {
    http: reqwest::Client,
    base_url: String,
    user: Option<String>,
    pass: Option<String>,
}

impl RcClient {
    /// Builds a client from configuration. Never fails: a malformed
    /// `base_url` simply causes every subsequent call to report
    /// "unknown" rather than failing construction.
    #[must_use]
    pub fn new(config: &RcConfig) -> Self {
        #[allow(clippy::unwrap_used)]
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap();
        Self {
            http,
            base_url: config.url.clone(),
            user: config.user.clone(),
            pass: config.pass.clone(),
        }
    }

    /// Polls `core/stats`. Returns [`RcStats::unknown`] on any failure.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> RcStats {
        let url = format!("{}/core/stats", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(&url);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.clone());
        }

        match request.send().await {
            Ok(response) => match response.json::<RcStats>().await {
                Ok(stats) => stats,
                Err(err) => {
                    warn!(error = %err, "failed to parse core/stats response");
                    RcStats::unknown()
                }
            },
            Err(err) => {
                warn!(error = %err, "core/stats request failed");
                RcStats::unknown()
            }
        }
    }

    /// Liveness probe against `rc/noop`.
    #[instrument(skip(self))]
    pub async fn noop(&self) -> bool {
        let url = format!("{}/rc/noop", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(&url);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.clone());
        }
        matches!(request.send().await, Ok(response) if response.status().is_success())
    }

    /// Ensures a standalone control-plane daemon is listening, spawning
    /// it via `spawner` if `rc/noop` does not already respond.
    ///
    /// The daemon is never torn down by the caller (spec.md §4.6, §9):
    /// this function only launches it and confirms it came up within a
    /// bounded number of probe attempts; it does not join or track the
    /// child afterward.
    #[instrument(skip(self, spawner))]
    pub async fn ensure_daemon_running(
        &self,
        spawner: &Arc<dyn ProcessSpawner>,
        binary: &std::path::Path,
        daemon_args: &[String],
    ) -> Result<(), EngineError> {
        if self.noop().await {
            debug!("control-plane already listening, not spawning a daemon");
            return Ok(());
        }

        // Spawning without killing on drop: the handle is dropped at
        // the end of this function, but the daemon process itself is
        // never torn down by this orchestrator (spec.md §4.6, §9).
        let _process = spawner.spawn(binary, daemon_args).await?;

        for attempt in 0..NOOP_PROBE_ATTEMPTS {
            tokio::time::sleep(NOOP_PROBE_INTERVAL).await;
            if self.noop().await {
                debug!(attempt, "standalone control-plane came up");
                return Ok(());
            }
        }

        warn!("standalone control-plane did not respond after spawning");
        Ok(())
    }
}
