//! The file transfer driven during a backup.
//!

use core::time::Duration;
use std::{io, path::PathBuf};

use thiserror::Error;

mod process_table;
mod progress;
mod rsync;

pub use process_table::{SystemProcessTable, command_line_matches};
pub use progress::{LogTail, ProgressPhase, ProgressRatio, normalize};
pub use rsync::RsyncEngine;

/// How the copy process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyExit {
    /// Exited with status zero.
    Success,

    /// Exited with a non-zero status, or was killed if there is no code.
    Failed(Option<i32>),
}

/// A file transfer that runs in the background while its progress is observed.
pub trait TransferEngine {
    /// Start the transfer without waiting for it to complete.
    fn start(&mut self) -> Result<(), TransferError>;

    /// The most recent progress the transfer reported, if any yet.
    fn progress_ratio(&mut self) -> Result<Option<ProgressRatio>, TransferError>;

    /// If the transfer is still running.
    fn is_running(&mut self) -> Result<bool, TransferError>;

    /// How the transfer exited, `None` while it is running.
    fn exit_status(&mut self) -> Result<Option<CopyExit>, TransferError>;

    /// Finalise a completed transfer. Returns where its log was kept, if it has one.
    fn finish(&mut self) -> Result<Option<PathBuf>, TransferError>;

    /// Stop the transfer.
    fn abort(&mut self);
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to start the copy process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("The copy process is not running")]
    NotStarted,

    #[error("The copy process failed with exit status {}", .0.map_or("<killed>".to_string(), |code| code.to_string()))]
    CopyFailed(Option<i32>),

    #[error("Timed out after {0:?} waiting for the transfer to complete")]
    Timeout(Duration),

    #[error("Cancelled while transferring")]
    Cancelled,
}
