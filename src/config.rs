//! On-disk JSON configuration (spec.md §6), parsed once at startup.
//!
//! [`ConfigError`] distinguishes "file unreadable" from "malformed
//! JSON" from "semantically invalid" so the CLI can report a precise
//! fatal-configuration error (spec.md §7 item 7).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default provider-side daily quota cap (750 GiB), per spec.md §3.
pub const DEFAULT_QUOTA_CAP_BYTES: u64 = 750 * 1024 * 1024 * 1024;

/// Fraction of the quota cap withheld to avoid provider-side rejection
/// (spec.md §3 "safety_margin defaults to 5%").
pub const DEFAULT_SAFETY_MARGIN_FRACTION: f64 = 0.05;

/// Errors encountered loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file was not valid JSON or did not match the schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
    /// The config parsed but failed semantic validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Named uploader bindings.
    pub uploaders: HashMap<String, UploaderConfig>,
    /// Core orchestrator settings.
    #[serde(default)]
    pub core: CoreConfig,
    /// Control-plane (rc) connection settings.
    pub rc: RcConfig,
    /// Rate-limit substring → delay-hours mapping (spec.md §6).
    #[serde(default)]
    pub rate_limits: HashMap<String, f64>,
}

impl Config {
    /// Loads and validates configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON matching the
    /// schema, or [`ConfigError::Invalid`] if it fails semantic checks.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.uploaders.is_empty() {
            return Err(ConfigError::Invalid(
                "config must define at least one uploader".to_string(),
            ));
        }
        for (name, uploader) in &self.uploaders {
            // `credentials` itself is populated later by
            // `resolve_credentials` (after `load` returns), so checking
            // it here would reject every config outright. Check the
            // directory it will be resolved from instead.
            let has_credential_file = std::fs::read_dir(&uploader.credential_path)
                .map(|entries| entries.filter_map(Result::ok).any(|entry| entry.path().is_file()))
                .unwrap_or(false);
            if !has_credential_file {
                return Err(ConfigError::Invalid(format!(
                    "uploader '{name}' has no credential files in '{}'",
                    uploader.credential_path.display()
                )));
            }
        }
        if self.core.quota_cap_bytes == 0 {
            return Err(ConfigError::Invalid(
                "core.quota_cap_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the safety margin in bytes for this configuration.
    #[must_use]
    pub fn safety_margin_bytes(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let margin = (self.core.quota_cap_bytes as f64 * DEFAULT_SAFETY_MARGIN_FRACTION) as u64;
        margin
    }
}

/// A named binding of {local source, remote destination, credential pool,
/// engine extras, optional chunk config} (spec.md §3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploaderConfig {
    /// Local filesystem path to upload from.
    pub local_path: PathBuf,
    /// Remote destination (engine-specific remote:path syntax).
    pub remote_path: String,
    /// Directory containing credential files, read in deterministic sort
    /// order to build `credentials` (spec.md §6). Populated by
    /// [`UploaderConfig::resolve_credentials`].
    pub credential_path: PathBuf,
    /// Extra engine flags passed through verbatim.
    #[serde(default)]
    pub engine_extras: HashMap<String, String>,
    /// Optional chunked-upload behavior (C4).
    #[serde(default)]
    pub chunked_upload: ChunkedUploadConfig,
    /// Resolved credential pool, in deterministic (sorted) order. Empty
    /// until [`UploaderConfig::resolve_credentials`] is called; CLI
    /// startup always calls it before the session loop runs.
    #[serde(default)]
    pub credentials: Vec<String>,
}

impl UploaderConfig {
    /// Populates `credentials` from the sorted directory listing of
    /// `credential_path`, per spec.md §6.
    ///
    /// # Errors
    ///
    /// Returns an error if `credential_path` cannot be read.
    pub fn resolve_credentials(&mut self) -> std::io::Result<()> {
        let mut names: Vec<String> = std::fs::read_dir(&self.credential_path)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        self.credentials = names;
        Ok(())
    }
}

/// Chunked-upload configuration (C4, spec.md §4.4 / §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkedUploadConfig {
    /// Whether pre-partitioning into fixed-count batches is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of files per batch.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Bound (seconds) on how long the queue-distribution capturer waits.
    #[serde(default = "default_generate_list_timeout")]
    pub generate_list_timeout: u64,
}

impl Default for ChunkedUploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: default_chunk_size(),
            generate_list_timeout: default_generate_list_timeout(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}

fn default_generate_list_timeout() -> u64 {
    600
}

/// Core orchestrator settings (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Path to the engine binary (`rclone`-compatible).
    #[serde(default = "default_engine_binary_path")]
    pub engine_binary_path: PathBuf,
    /// Nominal per-credential daily quota, in bytes.
    #[serde(default = "default_quota_cap")]
    pub quota_cap_bytes: u64,
    /// Whether a stage that fails with partial progress is retried
    /// automatically on the same credential; see DESIGN.md for the
    /// resolution. Defaults to `false` (no auto-retry) when absent,
    /// matching spec.md §7 item 5.
    #[serde(default)]
    pub retry_partial_failures: bool,
    /// Maximum number of stages attempted per credential before forcing
    /// rotation (spec.md §4.8 state machine `stage+1 <= max_stages`).
    #[serde(default = "default_max_stages")]
    pub max_stages: u32,
    /// Minimum viable remaining quota below which a credential is
    /// retired even if technically eligible (spec.md §4.8, "≈10 GiB").
    #[serde(default = "default_min_viable_bytes")]
    pub min_viable_bytes: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            engine_binary_path: default_engine_binary_path(),
            quota_cap_bytes: default_quota_cap(),
            retry_partial_failures: false,
            max_stages: default_max_stages(),
            min_viable_bytes: default_min_viable_bytes(),
        }
    }
}

fn default_engine_binary_path() -> PathBuf {
    PathBuf::from("rclone")
}

fn default_quota_cap() -> u64 {
    DEFAULT_QUOTA_CAP_BYTES
}

fn default_max_stages() -> u32 {
    10
}

fn default_min_viable_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

/// Control-plane connection settings (spec.md §4.6, §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RcConfig {
    /// Base URL of the engine's control-plane (e.g. `http://127.0.0.1:5572`).
    pub url: String,
    /// Basic-auth username, if the control-plane requires it.
    #[serde(default)]
    pub user: Option<String>,
    /// Basic-auth password, if the control-plane requires it.
    #[serde(default)]
    pub pass: Option<String>,
    /// Standalone `rcd` daemon settings.
    #[serde(default)]
    pub standalone: StandaloneConfig,
}

/// Standalone control-plane daemon settings (spec.md §4.6).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StandaloneConfig {
    /// Whether the orchestrator should spawn and supervise `rcd`.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the daemon to (e.g. `127.0.0.1:5572`).
    #[serde(default)]
    pub addr: Option<String>,
    /// Whether to enable the daemon's web GUI.
    #[serde(default)]
    pub web_gui: bool,
    /// Whether to disable auth on the daemon.
    #[serde(default)]
    pub no_auth: bool,
    /// Daemon basic-auth username.
    #[serde(default)]
    pub user: Option<String>,
    /// Daemon basic-auth password.
    #[serde(default)]
    pub pass: Option<String>,
}
