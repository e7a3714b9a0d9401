//! CLI entry point for the upload scheduler.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use shepherd_core::ban::{self, BanSet};
use shepherd_core::config::{Config, StandaloneConfig};
use shepherd_core::distribution::{self, DistributionSource, DistributionTracker, LearnedSizesEntry};
use shepherd_core::engine::{EngineDriver, ProcessSpawner, TokioProcessSpawner};
use shepherd_core::quota::{self, QuotaLedger};
use shepherd_core::rc::RcClient;
use shepherd_core::session::{self, publisher::SessionPublisher, SessionContext};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs).
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    match &args.command {
        Command::Upload { uploader } => {
            run_upload(&args.config, &args.state_dir, uploader.as_deref()).await
        }
        Command::Run | Command::Cleanup | Command::Move => {
            warn!(
                "this subcommand belongs to the auxiliary pipeline (notification dispatch, \
                 cleanup, local-mover), which this build does not implement"
            );
            bail!("subcommand not implemented by the upload scheduler");
        }
    }
}

/// Drives the `upload` subcommand: loads configuration, restores every
/// durable cache, and runs each selected uploader's session to completion.
async fn run_upload(config_path: &Path, state_dir: &Path, only: Option<&str>) -> Result<()> {
    info!("upload shepherd starting");

    let mut config = Config::load(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    for (name, uploader) in &mut config.uploaders {
        uploader
            .resolve_credentials()
            .with_context(|| format!("resolving credentials for uploader '{name}'"))?;
        info!(
            uploader = name.as_str(),
            credentials = uploader.credentials.len(),
            "resolved credential pool"
        );
    }

    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating state directory {}", state_dir.display()))?;

    let quota = QuotaLedger::load(
        quota::default_cache_path(state_dir),
        config.core.quota_cap_bytes,
        config.safety_margin_bytes(),
    );
    let ban = BanSet::load(ban::default_cache_path(state_dir));

    let spawner: Arc<dyn ProcessSpawner> = Arc::new(TokioProcessSpawner);
    let engine = EngineDriver::new(Arc::clone(&spawner));

    let rc_client = RcClient::new(&config.rc);
    if config.rc.standalone.enabled {
        let daemon_args = standalone_daemon_args(&config.rc.standalone);
        rc_client
            .ensure_daemon_running(&spawner, &config.core.engine_binary_path, &daemon_args)
            .await
            .context("starting standalone control-plane daemon")?;
    }

    let learned_sizes_path = distribution::default_cache_path(state_dir);
    let mut learned_sizes = distribution::load_cache(&learned_sizes_path);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing the current stage then stopping");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let uploader_names = select_uploaders(&config, only)?;

    let mut any_aborted = false;
    for uploader_name in &uploader_names {
        let uploader = &config.uploaders[uploader_name];

        let queue_distribution = DistributionTracker::new(DistributionSource::CheckerQueue);
        let history_distribution = DistributionTracker::new(DistributionSource::CompletedTransfers);

        let scratch_dir = state_dir.join("scratch").join(uploader_name);
        std::fs::create_dir_all(&scratch_dir).with_context(|| {
            format!("creating scratch directory for uploader '{uploader_name}'")
        })?;

        let mut publisher = SessionPublisher::new(
            session::publisher::default_snapshot_path(state_dir),
            uploader_name.clone(),
        );

        let mut ctx = SessionContext {
            quota: &quota,
            ban: &ban,
            queue_distribution: &queue_distribution,
            history_distribution: &history_distribution,
            engine: &engine,
            rc_client: Some(&rc_client),
            publisher: &mut publisher,
            rate_limit_delays: &config.rate_limits,
            scratch_dir: &scratch_dir,
            cancel: Arc::clone(&cancel),
        };

        info!(uploader = uploader_name.as_str(), "starting uploader session");
        let report = session::run_uploader(uploader_name, uploader, &config.core, &mut ctx)
            .await
            .with_context(|| format!("running uploader '{uploader_name}'"))?;

        info!(
            uploader = uploader_name.as_str(),
            files = report.total_files,
            bytes = report.total_bytes,
            credentials_used = report.credentials_used.len(),
            skipped = report.skipped,
            aborted = report.aborted,
            duration_secs = report.duration.as_secs_f64(),
            "uploader session finished"
        );

        learned_sizes.insert(
            uploader_name.clone(),
            LearnedSizesEntry {
                queue_distribution: Some(queue_distribution.snapshot()),
                transfer_history: Some(history_distribution.snapshot()),
            },
        );
        any_aborted |= report.aborted;

        if cancel.load(Ordering::SeqCst) {
            info!("stopping before remaining uploaders due to interrupt");
            break;
        }
    }

    distribution::persist_cache(&learned_sizes_path, &learned_sizes);

    if any_aborted {
        bail!("one or more uploader sessions aborted");
    }

    info!("upload shepherd finished");
    Ok(())
}

/// Resolves the `upload <uploader>` filter into the ordered list of
/// uploader names to run, defaulting to every configured uploader in
/// deterministic (sorted) order.
fn select_uploaders(config: &Config, only: Option<&str>) -> Result<Vec<String>> {
    match only {
        Some(name) => {
            if !config.uploaders.contains_key(name) {
                bail!("no such uploader '{name}' in configuration");
            }
            Ok(vec![name.to_string()])
        }
        None => {
            let mut names: Vec<String> = config.uploaders.keys().cloned().collect();
            names.sort();
            Ok(names)
        }
    }
}

/// Builds the argument list for a standalone `rcd` daemon invocation
/// from configuration (spec.md §4.6).
fn standalone_daemon_args(standalone: &StandaloneConfig) -> Vec<String> {
    let mut args = vec!["rcd".to_string()];
    if let Some(addr) = &standalone.addr {
        args.push(format!("--rc-addr={addr}"));
    }
    if standalone.web_gui {
        args.push("--rc-web-gui".to_string());
    }
    if standalone.no_auth {
        args.push("--rc-no-auth".to_string());
    }
    if let Some(user) = &standalone.user {
        args.push(format!("--rc-user={user}"));
    }
    if let Some(pass) = &standalone.pass {
        args.push(format!("--rc-pass={pass}"));
    }
    args
}
