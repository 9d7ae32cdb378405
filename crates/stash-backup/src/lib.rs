//! # stash-backup
//! Orchestrates a DIY backup of a Stash / Bitbucket Server instance: lock the
//! server, wait for it to drain, copy its home directory and report progress,
//! then unlock.
//!

pub mod cancellation;
pub mod capability;
pub mod client;
pub mod config;
pub mod context;
pub mod drain;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod transfer;

pub use client::{ApiError, BackupToken, LockToken, MaintenanceApi, RestClient};
pub use config::{ConfigError, Settings, Tuning, USAGE};
pub use orchestrator::{BackupError, BackupReport, Orchestrator, Phase, execute};
