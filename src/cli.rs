//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drives a pool of rotating service-account credentials through an
/// rclone-compatible engine, saturating each credential's daily quota
/// without exceeding it.
#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the JSON configuration file (spec.md §6).
    #[arg(short = 'f', long, default_value = "config.json", global = true)]
    pub config: PathBuf,

    /// Directory holding the persisted quota/ban/distribution/session
    /// caches (spec.md §6). Defaults to the current directory.
    #[arg(long, default_value = ".", global = true)]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands (spec.md §6). Only `upload` is in scope for
/// this crate; `run`, `cleanup`, and `move` are named so the CLI
/// surface matches the operator's muscle memory, but their auxiliary
/// jobs live outside the upload scheduler this crate implements.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the upload scheduler against one or all configured uploaders.
    Upload {
        /// Restrict the run to a single named uploader. Runs every
        /// uploader in the config when omitted.
        uploader: Option<String>,
    },
    /// Runs the full auxiliary pipeline (notification dispatch, cleanup,
    /// local-mover). Out of scope for this crate (spec.md §1).
    Run,
    /// Deletes stale remote objects already picked up by every mirror.
    /// Out of scope for this crate (spec.md §1).
    Cleanup,
    /// Moves locally-mirrored files out of the upload source tree. Out
    /// of scope for this crate (spec.md §1).
    Move,
}
