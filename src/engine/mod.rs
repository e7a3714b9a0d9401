//! Spawns and supervises one engine child process per stage (C5).
//!
//! An owned driver with `#[instrument]`'d async methods around a
//! spawned child process, consuming its combined stdout/stderr stream
//! line by line.

pub mod classify;
pub mod command;
pub mod spawner;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use thiserror::Error;

pub use classify::{classify_line, EngineEvent};
pub use spawner::{ProcessSpawner, SpawnedProcess, TokioProcessSpawner};

use crate::rc::RcClient;

/// Grace period between a graceful terminate and a forceful kill
/// (spec.md §5(ii): "bounded grace period (≈5 s)").
const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Delay after `max_transfer_reached` before the early-termination
/// probe fires (spec.md §4.5).
const EARLY_TERMINATION_DELAY: Duration = Duration::from_secs(5);

/// Errors from spawning or controlling the engine child process.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine binary could not be spawned.
    #[error("failed to spawn engine binary {binary}: {source}")]
    Spawn {
        /// Path to the engine binary.
        binary: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Sending a kill signal to the child failed.
    #[error("failed to kill engine process: {source}")]
    Kill {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting for the child to exit failed.
    #[error("failed waiting for engine process: {source}")]
    Wait {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Message sent from the engine driver to the session loop while a
/// stage is running (spec.md §5: reader emits events, poller emits
/// stats summaries, loop consumes both).
#[derive(Debug, Clone)]
pub enum StageMessage {
    /// A classified log-line event.
    Event(EngineEvent),
    /// A periodic control-plane stats summary (only sent when an
    /// `RcClient` was supplied to [`EngineDriver::run_stage`]).
    Stats(crate::rc::RcStats),
}

/// Result of one completed stage (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Whether the stage is considered successful.
    pub success: bool,
    /// Number of `file_complete` events observed.
    pub transfer_count: u64,
    /// Sum of bytes across all `file_complete` events observed.
    pub total_bytes: u64,
    /// Wall-clock duration of the stage.
    pub duration: Duration,
    /// Average throughput over `duration`, in bytes/sec.
    pub avg_speed: f64,
    /// The matched rate-limit class, if the stage ended due to one.
    pub rate_limit_kind: Option<String>,
    /// Ban delay in hours; `0.0` unless rate-limited.
    pub delay_hours: f64,
    /// Whether the stage ended via the early-termination path.
    pub early_terminated: bool,
}

/// Drives one child invocation of the engine binary.
pub struct EngineDriver {
    spawner: std::sync::Arc<dyn ProcessSpawner>,
}

impl EngineDriver {
    /// Creates a driver backed by `spawner`.
    #[must_use]
    pub fn new(spawner: std::sync::Arc<dyn ProcessSpawner>) -> Self {
        Self { spawner }
    }

    /// Requests a plain recursive filename listing from the engine
    /// (spec.md §4.4: "fast, no stat"), used by the chunker to
    /// partition the source tree before any transfer begins.
    ///
    /// `path` is the tree being listed — the local source path for a
    /// chunked upload, since the chunker partitions the *source*
    /// listing (spec.md §4.4, glossary), not whatever already exists on
    /// the remote.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the listing subcommand cannot be
    /// spawned.
    #[instrument(skip(self))]
    pub async fn list_files(
        &self,
        binary: &Path,
        path: &str,
    ) -> Result<Vec<String>, EngineError> {
        let args = vec!["lsf".to_string(), "-R".to_string(), path.to_string()];
        let mut process = self.spawner.spawn(binary, &args).await?;
        let mut lines = process.take_stdout().lines();

        let mut listing = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                listing.push(line);
            }
        }
        let _ = process.wait().await;
        Ok(listing)
    }

    /// Runs one stage: spawns the engine, consumes its combined log
    /// stream, classifies each line, relays events to `events` (when
    /// given), applies the early-termination path when the control
    /// plane confirms the engine has stopped starting transfers, and
    /// returns the stage's outcome once the child exits.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the child cannot be spawned or if
    /// controlling it (kill/wait) fails outright.
    #[instrument(skip(self, events, rc_client))]
    pub async fn run_stage(
        &self,
        binary: &Path,
        args: &[String],
        events: Option<mpsc::Sender<StageMessage>>,
        rc_client: Option<&RcClient>,
        source_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        let started_at = Instant::now();
        let mut process = self.spawner.spawn(binary, args).await?;

        let mut stdout_lines = process.take_stdout().lines();
        let mut stderr_lines = process.take_stderr().lines();

        let mut transfer_count: u64 = 0;
        let mut total_bytes: u64 = 0;
        let mut rate_limit_kind: Option<String> = None;
        let mut early_terminated = false;
        let mut early_termination_armed = false;
        let mut stdout_done = false;
        let mut stderr_done = false;

        let sleep = tokio::time::sleep(EARLY_TERMINATION_DELAY);
        tokio::pin!(sleep);

        let success = loop {
            if stdout_done && stderr_done {
                break self.finish_naturally(&mut process).await;
            }

            tokio::select! {
                biased;

                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => self.handle_line(
                            &line, &events, &mut transfer_count, &mut total_bytes,
                            &mut rate_limit_kind, &mut early_termination_armed, &mut sleep,
                            rc_client, source_root,
                        ).await,
                        Ok(None) => stdout_done = true,
                        Err(err) => { warn!(error = %err, "stdout read error"); stdout_done = true; }
                    }
                }

                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => self.handle_line(
                            &line, &events, &mut transfer_count, &mut total_bytes,
                            &mut rate_limit_kind, &mut early_termination_armed, &mut sleep,
                            rc_client, source_root,
                        ).await,
                        Ok(None) => stderr_done = true,
                        Err(err) => { warn!(error = %err, "stderr read error"); stderr_done = true; }
                    }
                }

                () = &mut sleep, if early_termination_armed => {
                    early_termination_armed = false;
                    if let Some(rc_client) = rc_client {
                        let stats = rc_client.stats().await;
                        if let Some(sender) = &events {
                            let _ = sender.send(StageMessage::Stats(stats.clone())).await;
                        }
                        if stats.looks_idle_but_checking() {
                            info!("early termination condition confirmed, stopping engine");
                            early_terminated = true;
                            break self.terminate_gracefully(&mut process).await;
                        }
                    }
                }
            }

            if rate_limit_kind.is_some() {
                break self.terminate_gracefully(&mut process).await;
            }
        };

        let duration = started_at.elapsed();
        #[allow(clippy::cast_precision_loss)]
        let avg_speed = if duration.as_secs_f64() > 0.0 {
            total_bytes as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Ok(StageOutcome {
            success: success && rate_limit_kind.is_none(),
            transfer_count,
            total_bytes,
            duration,
            avg_speed,
            delay_hours: 0.0,
            rate_limit_kind,
            early_terminated,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_line(
        &self,
        line: &str,
        events: &Option<mpsc::Sender<StageMessage>>,
        transfer_count: &mut u64,
        total_bytes: &mut u64,
        rate_limit_kind: &mut Option<String>,
        early_termination_armed: &mut bool,
        sleep: &mut std::pin::Pin<&mut tokio::time::Sleep>,
        rc_client: Option<&RcClient>,
        source_root: Option<&Path>,
    ) {
        let mut event = classify_line(line);

        if let EngineEvent::FileComplete { path, size: None } = &event {
            if let Some(size) = self.resolve_missing_size(path, rc_client, source_root).await {
                event = EngineEvent::FileComplete { path: path.clone(), size: Some(size) };
            }
        }

        match &event {
            EngineEvent::FileComplete { size, .. } => {
                *transfer_count += 1;
                if let Some(size) = size {
                    *total_bytes += size;
                }
            }
            EngineEvent::RateLimit { kind } => {
                *rate_limit_kind = Some(kind.clone());
            }
            EngineEvent::MaxTransferReached => {
                if !*early_termination_armed {
                    *early_termination_armed = true;
                    sleep
                        .as_mut()
                        .reset(tokio::time::Instant::now() + EARLY_TERMINATION_DELAY);
                }
            }
            EngineEvent::Fatal { .. } | EngineEvent::Ignore => {}
        }

        if let Some(sender) = events {
            let _ = sender.send(StageMessage::Event(event)).await;
        }
    }

    /// Fills in a size the log line didn't carry (spec.md §4.5): first
    /// by asking the control-plane for the matching entry, then as a
    /// last resort by `stat`-ing the file under `source_root`.
    async fn resolve_missing_size(
        &self,
        path: &str,
        rc_client: Option<&RcClient>,
        source_root: Option<&Path>,
    ) -> Option<u64> {
        if let Some(rc_client) = rc_client {
            let stats = rc_client.stats().await;
            if let Some(entry) = stats.transferring.iter().find(|entry| entry.name == path) {
                return Some(entry.size);
            }
        }

        if let Some(root) = source_root {
            if let Ok(metadata) = tokio::fs::metadata(root.join(path)).await {
                return Some(metadata.len());
            }
        }

        None
    }

    async fn terminate_gracefully(&self, process: &mut Box<dyn SpawnedProcess>) -> bool {
        if let Err(err) = process.terminate().await {
            warn!(error = %err, "graceful terminate failed, forcing kill");
        }

        let result = tokio::time::timeout(TERMINATE_GRACE_PERIOD, process.wait()).await;
        match result {
            Ok(Ok(success)) => success,
            Ok(Err(err)) => {
                warn!(error = %err, "error waiting after terminate");
                false
            }
            Err(_) => {
                warn!("engine did not exit within grace period, force-killing");
                let _ = process.force_kill().await;
                process.wait().await.unwrap_or(false)
            }
        }
    }

    async fn finish_naturally(&self, process: &mut Box<dyn SpawnedProcess>) -> bool {
        process.wait().await.unwrap_or(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spawner::FakeSpawnedProcess;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct FakeSpawner {
        stdout_lines: Vec<String>,
        stderr_lines: Vec<String>,
        terminated: Arc<AtomicBool>,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProcessSpawner for FakeSpawner {
        async fn spawn(
            &self,
            _binary: &Path,
            _args: &[String],
        ) -> Result<Box<dyn SpawnedProcess>, EngineError> {
            Ok(Box::new(FakeSpawnedProcess {
                stdout_lines: self.stdout_lines.clone(),
                stderr_lines: self.stderr_lines.clone(),
                terminated: self.terminated.clone(),
                killed: self.killed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_run_stage_counts_file_completes() {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(FakeSpawner {
            stdout_lines: vec![
                "Copied (new) a.bin (100 bytes)".to_string(),
                "Copied (new) b.bin (200 bytes)".to_string(),
            ],
            stderr_lines: vec![],
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
        });
        let driver = EngineDriver::new(spawner);
        let outcome = driver
            .run_stage(Path::new("rclone"), &[], None, None, None)
            .await
            .unwrap();

        assert_eq!(outcome.transfer_count, 2);
        assert_eq!(outcome.total_bytes, 300);
        assert!(outcome.success);
        assert!(!outcome.early_terminated);
    }

    #[tokio::test]
    async fn test_run_stage_detects_rate_limit_and_terminates() {
        let terminated = Arc::new(AtomicBool::new(false));
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(FakeSpawner {
            stdout_lines: vec!["googleapi: Error 403: userRateLimitExceeded".to_string()],
            stderr_lines: vec![],
            terminated: terminated.clone(),
            killed: Arc::new(AtomicBool::new(false)),
        });
        let driver = EngineDriver::new(spawner);
        let outcome = driver
            .run_stage(Path::new("rclone"), &[], None, None, None)
            .await
            .unwrap();

        assert!(outcome.rate_limit_kind.is_some());
        assert!(!outcome.success);
        assert!(terminated.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_stage_forwards_events_to_channel() {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(FakeSpawner {
            stdout_lines: vec!["Copied (new) a.bin (100 bytes)".to_string()],
            stderr_lines: vec![],
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
        });
        let driver = EngineDriver::new(spawner);
        let (tx, mut rx) = mpsc::channel(8);
        let _outcome = driver
            .run_stage(Path::new("rclone"), &[], Some(tx), None, None)
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message,
            StageMessage::Event(EngineEvent::FileComplete { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stage_with_no_matching_lines_is_plain_success() {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(FakeSpawner {
            stdout_lines: vec!["INFO: Transferred: 0 / 0, -".to_string()],
            stderr_lines: vec![],
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
        });
        let driver = EngineDriver::new(spawner);
        let outcome = driver
            .run_stage(Path::new("rclone"), &[], None, None, None)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.transfer_count, 0);
    }
}
