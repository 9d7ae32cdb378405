//! # common
//! In-memory stand-ins for the server and the transfer.
//!

#![allow(dead_code, missing_docs)]

use core::time::Duration;
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use serde_json::{Value, json};
use stash_backup::{
    ApiError, BackupToken, LockToken, MaintenanceApi,
    orchestrator::Timing,
    transfer::{CopyExit, ProgressPhase, ProgressRatio, TransferEngine, TransferError},
};

/// A call made against the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connectivity,
    LockAcquire,
    BackupStart(String),
    Status(String),
    Progress(String, u8),
    Release(String),
}

/// The fake server's scripted behaviour and call log.
#[derive(Debug)]
pub struct ServerState {
    pub calls: Vec<Call>,
    pub reachable: bool,
    pub lock_token: String,
    pub backup_id: String,
    pub statuses: VecDeque<Value>,
    pub release_body: String,
    pub progress_fails: bool,
}

/// A scripted [`MaintenanceApi`].
#[derive(Debug)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                calls: Vec::new(),
                reachable: true,
                lock_token: "T1".to_string(),
                backup_id: "B1".to_string(),
                statuses: VecDeque::from([drained()]),
                release_body: String::new(),
                progress_fails: false,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn releases(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Release(token) => Some(token),
                _ => None,
            })
            .collect()
    }

    pub fn reported(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Progress(_, percentage) => Some(percentage),
                _ => None,
            })
            .collect()
    }

    pub fn status_polls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Status(_)))
            .count()
    }
}

impl MaintenanceApi for FakeServer {
    fn connectivity_check(&self) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(Call::Connectivity);

        if state.reachable {
            Ok(())
        } else {
            Err(ApiError::InvalidUrl(
                "http://unreachable/".to_string(),
                "connection refused".to_string(),
            ))
        }
    }

    fn lock_acquire(&self) -> Result<LockToken, ApiError> {
        let mut state = self.state();
        state.calls.push(Call::LockAcquire);

        if state.lock_token.is_empty() {
            Err(ApiError::MissingField("unlockToken"))
        } else {
            Ok(LockToken::new(state.lock_token.clone()))
        }
    }

    fn backup_start(&self, lock: &LockToken) -> Result<BackupToken, ApiError> {
        let mut state = self.state();
        state.calls.push(Call::BackupStart(lock.as_str().to_string()));

        if state.backup_id.is_empty() {
            Err(ApiError::MissingField("id"))
        } else {
            Ok(BackupToken::new(state.backup_id.clone()))
        }
    }

    fn maintenance_status(&self, lock: &LockToken) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.push(Call::Status(lock.as_str().to_string()));

        // The last scripted status repeats forever.
        let status = if state.statuses.len() > 1 {
            state.statuses.pop_front()
        } else {
            state.statuses.front().cloned()
        };

        Ok(status.unwrap_or_else(draining))
    }

    fn progress_report(&self, lock: &LockToken, percentage: u8) -> Result<(), ApiError> {
        let mut state = self.state();
        state
            .calls
            .push(Call::Progress(lock.as_str().to_string(), percentage));

        if state.progress_fails {
            Err(ApiError::UnexpectedBody("Service Unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock_release(&self, lock: &LockToken) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(Call::Release(lock.as_str().to_string()));

        stash_backup::client::check_release_body(&state.release_body)
    }
}

pub fn drained() -> Value {
    json!({ "db-state": "DRAINED", "scm-state": "DRAINED" })
}

pub fn draining() -> Value {
    json!({ "db-state": "DRAINING", "scm-state": "DRAINED" })
}

/// A scripted [`TransferEngine`].
#[derive(Debug, Default)]
pub struct FakeTransfer {
    /// Returned in order by `progress_ratio`, the last repeats.
    pub progress: VecDeque<Option<ProgressRatio>>,
    /// Returned in order by `is_running`, `false` once exhausted.
    pub running: VecDeque<bool>,
    /// Returned by every `exit_status` call.
    pub exit: Option<CopyExit>,
    pub fail_start: bool,
    pub started: bool,
    pub finished: bool,
    pub aborted: bool,
}

impl FakeTransfer {
    /// A transfer reporting `to-chk` ratios of `remaining / 10`.
    pub fn checking(remaining: &[u64], running: &[bool]) -> Self {
        Self {
            progress: remaining
                .iter()
                .map(|remaining| Some(ProgressRatio::new(ProgressPhase::Checking, *remaining, 10)))
                .collect(),
            running: running.iter().copied().collect(),
            ..Self::default()
        }
    }
}

impl TransferEngine for FakeTransfer {
    fn start(&mut self) -> Result<(), TransferError> {
        if self.fail_start {
            return Err(TransferError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "rsync",
            )));
        }

        self.started = true;
        Ok(())
    }

    fn progress_ratio(&mut self) -> Result<Option<ProgressRatio>, TransferError> {
        let progress = if self.progress.len() > 1 {
            self.progress.pop_front()
        } else {
            self.progress.front().copied()
        };

        Ok(progress.flatten())
    }

    fn is_running(&mut self) -> Result<bool, TransferError> {
        Ok(self.running.pop_front().unwrap_or(false))
    }

    fn exit_status(&mut self) -> Result<Option<CopyExit>, TransferError> {
        Ok(self.exit)
    }

    fn finish(&mut self) -> Result<Option<PathBuf>, TransferError> {
        self.finished = true;
        Ok(Some(PathBuf::from("/backup/stash/stash-backup-rsync.log")))
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Poll without waiting and never time out.
pub fn instant_timing() -> Timing {
    Timing {
        poll_interval: Duration::ZERO,
        drain_timeout: None,
        transfer_timeout: None,
    }
}
