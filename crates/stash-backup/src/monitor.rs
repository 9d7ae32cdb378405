//! Follows a running transfer and reports its progress to the server.
//!

use core::time::Duration;
use std::path::PathBuf;

use shared::Failure;
use tracing::info;

use crate::{
    cancellation::{Cancellation, Deadline},
    client::{LockToken, MaintenanceApi},
    context::Context,
    transfer::{CopyExit, TransferEngine, TransferError},
};

/// Reported while the copy still runs despite its progress reading complete.
pub const FINISHING_PERCENTAGE: u8 = 99;

/// Reported once the copy has completed.
pub const COMPLETE_PERCENTAGE: u8 = 100;

/// What a completed transfer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Every percentage reported, in order.
    pub reported: Vec<u8>,

    /// Where the transfer's log was kept.
    pub log_file: Option<PathBuf>,
}

/// Start the transfer and report its progress every `interval` until it completes.
///
/// The transfer is complete once its progress reads 100% and it is no longer running.
/// While it still runs at 100%, 99% is reported instead.
pub fn monitor_transfer<A: MaintenanceApi, E: TransferEngine>(
    context: &Context,
    api: &A,
    engine: &mut E,
    lock: &LockToken,
    interval: Duration,
    deadline: &Deadline,
    cancellation: &Cancellation,
) -> Result<TransferSummary, TransferError> {
    engine.start()?;

    let mut reported = Vec::new();

    loop {
        if !cancellation.sleep(interval) {
            engine.abort();
            return Err(TransferError::Cancelled);
        }
        if deadline.is_expired() {
            engine.abort();
            return Err(TransferError::Timeout(deadline.elapsed()));
        }

        let exit = engine.exit_status()?;
        if let Some(CopyExit::Failed(code)) = exit {
            return Err(TransferError::CopyFailed(code));
        }

        let progress = engine.progress_ratio()?;
        let mut percentage = progress.map_or(0, |ratio| ratio.percentage());

        // A clean exit without a final progress line means there was nothing left to copy.
        let mut complete = false;
        if percentage == COMPLETE_PERCENTAGE || exit == Some(CopyExit::Success) {
            if engine.is_running()? {
                percentage = FINISHING_PERCENTAGE;
            } else {
                percentage = COMPLETE_PERCENTAGE;
                complete = true;
            }
        }

        info!("{context}Transfer at {percentage}%");
        api.progress_report(lock, percentage)
            .or_warn(&format!("{context}Could not report progress"));
        reported.push(percentage);

        if complete {
            let log_file = engine.finish()?;
            return Ok(TransferSummary { reported, log_file });
        }
    }
}
