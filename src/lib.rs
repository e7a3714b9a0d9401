//! Upload Shepherd Core Library
//!
//! This library provides the core upload-scheduling logic for driving an
//! rclone-compatible transfer engine across a pool of rotating
//! service-account credentials, each subject to an independent per-24h
//! byte quota enforced by the cloud provider.
//!
//! # Architecture
//!
//! The library is organized into the following modules, leaves first:
//! - [`quota`] - durable per-credential rolling 24h byte counter (C1)
//! - [`ban`] - durable set of currently-suspended credentials (C2)
//! - [`distribution`] - reservoir-sampled file-size histogram (C3)
//! - [`chunker`] - optional pre-partitioning of a work listing (C4)
//! - [`engine`] - spawns and supervises the transfer engine child (C5)
//! - [`rc`] - HTTP client for the engine's control-plane API (C6)
//! - [`strategy`] - pure (quota, distribution, stage) -> parameters (C7)
//! - [`session`] - the top-level per-uploader state machine (C8/C9)
//! - [`config`] - on-disk JSON configuration
//! - [`persistence`] - atomic write-behind shared by every on-disk cache

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ban;
pub mod chunker;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod persistence;
pub mod quota;
pub mod rc;
pub mod session;
pub mod strategy;

// Re-export commonly used types
pub use ban::BanSet;
pub use config::{Config, CoreConfig, RcConfig, UploaderConfig};
pub use distribution::{DistributionSnapshot, DistributionSource, DistributionTracker};
pub use engine::{EngineDriver, EngineError, StageOutcome};
pub use quota::QuotaLedger;
pub use rc::RcClient;
pub use session::{SessionContext, SessionError, SessionReport};
pub use strategy::{select_strategy, StageParams};
