//! Top-level state machine driving one uploader end to end (C8).
//!
//! A single orchestration function that owns the state machine and
//! delegates the actual work (spawning, classification, accounting) to
//! focused collaborators rather than inlining everything into one
//! match arm.

pub mod publisher;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::ban::BanSet;
use crate::chunker::ChunkPlan;
use crate::config::{CoreConfig, UploaderConfig};
use crate::distribution::{DistributionSource, DistributionTracker};
use crate::engine::{self, EngineDriver, EngineEvent, StageMessage};
use crate::quota::QuotaLedger;
use crate::rc::RcClient;
use crate::strategy::select_strategy;
use publisher::SessionPublisher;

/// Only this error variant can represent a session-level abort
/// (spec.md §7's closing line: "Only C8 may declare a session-level
/// abort").
#[derive(Debug, Error)]
pub enum SessionError {
    /// An engine invocation could not even be spawned.
    #[error("engine driver error: {0}")]
    Engine(#[from] engine::EngineError),
    /// A chunk-plan artifact could not be materialized.
    #[error("chunker error: {0}")]
    Chunker(#[from] crate::chunker::ChunkerError),
}

/// Explicit state enum for the per-uploader session loop
/// (spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    SelectCredential,
    StageBegin { credential: String, stage: u32 },
    Skipped,
    Aborted { reason: String },
    Done,
}

/// Summary returned once `run_uploader` finishes (spec.md §4.8
/// "cumulative metrics").
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Total `file_complete` events across every stage this session.
    pub total_files: u64,
    /// Total bytes accounted across every stage this session.
    pub total_bytes: u64,
    /// Wall-clock duration of the whole session.
    pub duration: Duration,
    /// Credentials used, in order.
    pub credentials_used: Vec<String>,
    /// Whether the uploader was skipped (no eligible credential at
    /// start).
    pub skipped: bool,
    /// Whether the session aborted due to a fatal engine event.
    pub aborted: bool,
}

/// Collaborators a session needs, bundled so `run_uploader` doesn't
/// take a dozen positional parameters.
pub struct SessionContext<'a> {
    /// Quota ledger shared across uploaders (C1).
    pub quota: &'a QuotaLedger,
    /// Ban set shared across uploaders (C2).
    pub ban: &'a BanSet,
    /// Checker-queue distribution tracker for this uploader (C3).
    pub queue_distribution: &'a DistributionTracker,
    /// Completed-transfer distribution tracker for this uploader (C3).
    pub history_distribution: &'a DistributionTracker,
    /// Engine driver shared across uploaders (C5).
    pub engine: &'a EngineDriver,
    /// Control-plane client, if configured (C6).
    pub rc_client: Option<&'a RcClient>,
    /// Session state publisher for this uploader (C9).
    pub publisher: &'a mut SessionPublisher,
    /// Rate-limit kind substring -> ban delay in hours (spec.md §6).
    pub rate_limit_delays: &'a std::collections::HashMap<String, f64>,
    /// Scratch directory for chunk artifacts.
    pub scratch_dir: &'a std::path::Path,
    /// Set by an operator interrupt; checked between stages.
    pub cancel: Arc<AtomicBool>,
}

const DEFAULT_RATE_LIMIT_DELAY_HOURS: f64 = 24.0;

/// Polling cadence for the background queue-distribution capturer
/// (spec.md §5: "≈ 2-3 s").
const QUEUE_CAPTURE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Runs the full session loop for one uploader: iterate credentials;
/// for each credential, iterate stages; drive the engine with
/// C7-computed parameters; react to events; persist via C1/C2.
///
/// # Errors
///
/// Returns [`SessionError`] only for conditions that must abort the
/// whole uploader (spec.md §7: "Only C8 may declare a session-level
/// abort") — everything else is handled by rotating credentials or
/// ending the session normally.
#[instrument(skip(uploader_name, uploader, core, ctx))]
pub async fn run_uploader(
    uploader_name: &str,
    uploader: &UploaderConfig,
    core: &CoreConfig,
    ctx: &mut SessionContext<'_>,
) -> Result<SessionReport, SessionError> {
    let started_at = Instant::now();
    ctx.publisher.start_session();

    // Chunked uploads partition the whole uploader's source listing once,
    // up front, rather than per credential: the chunk cursor advances
    // across credential rotations, since a chunk re-attempted under a new
    // credential is the same file-list batch, not a fresh one
    // (spec.md §4.4).
    let mut chunk_plan = if uploader.chunked_upload.enabled {
        let local_path = uploader.local_path.to_string_lossy().into_owned();
        let listing = ctx
            .engine
            .list_files(&core.engine_binary_path, &local_path)
            .await?;
        info!(uploader = uploader_name, files = listing.len(), "chunked upload: captured master listing");
        Some(ChunkPlan::plan(listing, uploader.chunked_upload.chunk_size))
    } else {
        None
    };
    let mut chunk_cursor = 0usize;

    let mut report = SessionReport::default();
    let mut state = SessionState::SelectCredential;
    let mut credential_index = 0usize;

    loop {
        state = match state {
            SessionState::SelectCredential => {
                if ctx.cancel.load(Ordering::SeqCst) {
                    SessionState::Done
                } else {
                    match select_credential(uploader_name, &uploader.credentials, ctx) {
                        Some(credential) => {
                            credential_index += 1;
                            ctx.publisher.update_credential(
                                credential_index,
                                &credential,
                                uploader.credentials.len(),
                            );
                            if !report.credentials_used.contains(&credential) {
                                report.credentials_used.push(credential.clone());
                            }
                            SessionState::StageBegin { credential, stage: 1 }
                        }
                        None => SessionState::Skipped,
                    }
                }
            }

            SessionState::StageBegin { credential, stage } => {
                ctx.publisher.update_stage(stage);
                // The capturer only ever runs once per uploader: on the very
                // first stage of the very first selected credential, and only
                // if no queue distribution has been observed yet (a restart
                // picking up a warm cache skips it entirely, spec.md §4.8).
                let capture_queue =
                    credential_index == 1 && stage == 1 && ctx.queue_distribution.snapshot().count == 0;
                run_stage_cycle(
                    uploader_name,
                    uploader,
                    core,
                    &credential,
                    stage,
                    &mut report,
                    ctx,
                    chunk_plan.as_mut(),
                    &mut chunk_cursor,
                    capture_queue,
                )
                .await?
            }

            SessionState::Skipped | SessionState::Aborted { .. } | SessionState::Done => {
                break;
            }
        };
    }

    report.skipped = matches!(state, SessionState::Skipped);
    report.aborted = matches!(state, SessionState::Aborted { .. });
    if let SessionState::Aborted { reason } = &state {
        warn!(uploader = uploader_name, reason, "uploader session aborted");
    }
    if report.skipped {
        info!(uploader = uploader_name, "no eligible credential, skipping uploader");
    }

    report.duration = started_at.elapsed();
    ctx.publisher.end_session();
    Ok(report)
}

/// Runs one stage for `credential` and decides the next state
/// (spec.md §4.8's `STAGE_BEGIN`/`STAGE_RUN`/`STAGE_END` transitions).
#[allow(clippy::too_many_arguments)]
async fn run_stage_cycle(
    uploader_name: &str,
    uploader: &UploaderConfig,
    core: &CoreConfig,
    credential: &str,
    stage: u32,
    report: &mut SessionReport,
    ctx: &mut SessionContext<'_>,
    chunk_plan: Option<&mut ChunkPlan>,
    chunk_cursor: &mut usize,
    capture_queue: bool,
) -> Result<SessionState, SessionError> {
    let mut chunk_plan = chunk_plan;
    if let Some(plan) = chunk_plan.as_deref() {
        if *chunk_cursor >= plan.batch_count() {
            info!(uploader = uploader_name, "all chunks uploaded, ending session");
            return Ok(SessionState::Done);
        }
    }

    let remaining = ctx.quota.remaining(uploader_name, credential);
    let snapshot = if ctx.queue_distribution.snapshot().count > 0 {
        Some(ctx.queue_distribution.snapshot())
    } else {
        None
    };
    let params = select_strategy(remaining, core.quota_cap_bytes, snapshot.as_ref(), stage);

    let chunk_artifact = match chunk_plan.as_deref_mut() {
        Some(plan) => Some(plan.materialize_batch(ctx.scratch_dir, *chunk_cursor)?),
        None => None,
    };

    let args = engine::command::build_args(&params, uploader, credential, chunk_artifact.as_deref());

    let (tx, mut rx) = mpsc::channel(256);
    let run_fut = ctx
        .engine
        .run_stage(
            &core.engine_binary_path,
            &args,
            Some(tx),
            ctx.rc_client,
            Some(uploader.local_path.as_path()),
        );
    tokio::pin!(run_fut);

    let capture_queue = capture_queue && ctx.rc_client.is_some();
    let rc_client_for_capture = ctx.rc_client;
    let queue_tracker = ctx.queue_distribution;
    let capture_timeout = Duration::from_secs(uploader.chunked_upload.generate_list_timeout);
    let capture_fut = async move {
        if let Some(rc_client) = rc_client_for_capture.filter(|_| capture_queue) {
            capture_queue_distribution(rc_client, queue_tracker, capture_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(capture_fut);
    let mut capture_done = !capture_queue;

    let mut outcome = None;
    loop {
        tokio::select! {
            result = &mut run_fut, if outcome.is_none() => {
                outcome = Some(result);
            }
            () = &mut capture_fut, if !capture_done => {
                capture_done = true;
            }
            message = rx.recv() => {
                match message {
                    Some(StageMessage::Event(EngineEvent::FileComplete { size: Some(size), .. })) => {
                        ctx.quota.add(uploader_name, credential, size);
                        ctx.history_distribution.observe(size);
                        report.total_files += 1;
                        report.total_bytes += size;
                    }
                    Some(StageMessage::Event(_) | StageMessage::Stats(_)) | None if message.is_none() => {
                        if outcome.is_some() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(plan) = chunk_plan.as_deref_mut() {
        plan.cleanup();
    }
    #[allow(clippy::unwrap_used)]
    let outcome = outcome.unwrap()?;

    if let Some(kind) = &outcome.rate_limit_kind {
        let delay_hours = lookup_delay_hours(kind, ctx.rate_limit_delays);
        let until = std::time::SystemTime::now() + Duration::from_secs_f64(delay_hours * 3600.0);
        ctx.ban.ban(uploader_name, credential, until);
        return Ok(SessionState::SelectCredential);
    }

    if !outcome.success {
        if core.retry_partial_failures && outcome.transfer_count > 0 {
            return Ok(SessionState::StageBegin {
                credential: credential.to_string(),
                stage,
            });
        }
        return Ok(SessionState::Aborted {
            reason: "engine stage failed with no recognized event".to_string(),
        });
    }

    // This chunk's batch fully transferred; advance to the next one on
    // the next invocation (possibly under a rotated credential).
    if chunk_plan.is_some() {
        *chunk_cursor += 1;
    }

    let remaining_after = ctx.quota.remaining(uploader_name, credential);
    if remaining_after < core.min_viable_bytes {
        return Ok(SessionState::SelectCredential);
    }
    if stage + 1 <= core.max_stages {
        return Ok(SessionState::StageBegin {
            credential: credential.to_string(),
            stage: stage + 1,
        });
    }
    Ok(SessionState::SelectCredential)
}

/// Deterministic credential selection (spec.md §4.8): sweep expired
/// quota, clear the paired bans, refresh expired bans, then pick the
/// first eligible, unbanned credential in configured order. This
/// ordering is what makes P2 hold.
fn select_credential(
    uploader_name: &str,
    credentials: &[String],
    ctx: &SessionContext<'_>,
) -> Option<String> {
    let expired_quota = ctx.quota.sweep();
    let expired_quota_for_uploader: Vec<(String, String)> = expired_quota
        .into_iter()
        .filter(|(u, _)| u == uploader_name)
        .collect();
    ctx.ban.clear_for_quota_expiry(&expired_quota_for_uploader);
    ctx.ban.refresh();

    credentials
        .iter()
        .find(|credential| {
            !ctx.ban.is_banned(uploader_name, credential) && ctx.quota.eligible(uploader_name, credential)
        })
        .cloned()
}

/// Polls the control-plane and feeds previously-unseen `transferring`
/// sizes into `tracker` until the checking queue has drained or
/// `timeout` elapses (spec.md §4.3, §4.8).
///
/// Runs concurrently with the first stage of the session, not before
/// it: the checking queue only exists once the engine is already
/// scanning the source tree. Stops immediately if the checker never
/// populates (e.g. the whole tree is already up to date) rather than
/// waiting out the full timeout for nothing.
#[instrument(skip(rc_client, tracker))]
async fn capture_queue_distribution(
    rc_client: &RcClient,
    tracker: &DistributionTracker,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    let mut seen = std::collections::HashSet::new();
    let mut ever_populated = false;

    loop {
        tokio::time::sleep(QUEUE_CAPTURE_POLL_INTERVAL).await;
        if Instant::now() >= deadline {
            info!("queue distribution capture timed out, proceeding with what was observed");
            return;
        }

        let stats = rc_client.stats().await;
        if !stats.known {
            continue;
        }

        for entry in &stats.transferring {
            if seen.insert(entry.name.clone()) {
                tracker.observe(entry.size);
            }
        }

        if stats.checking.is_empty() {
            if ever_populated {
                return;
            }
            // Never saw anything in the checking queue: nothing more to
            // learn from waiting out the rest of the timeout.
            return;
        }
        ever_populated = true;
    }
}

fn lookup_delay_hours(kind: &str, rate_limit_delays: &std::collections::HashMap<String, f64>) -> f64 {
    rate_limit_delays
        .iter()
        .find(|(substring, _)| kind.contains(substring.as_str()))
        .map_or(DEFAULT_RATE_LIMIT_DELAY_HOURS, |(_, delay)| *delay)
}

/// Default state-directory layout helper, used by the CLI to locate
/// all four persisted caches under one directory.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}
