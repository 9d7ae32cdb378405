//! Waits for the server's database and SCM subsystems to drain.
//!

use core::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    cancellation::{Cancellation, Deadline},
    client::{LockToken, MaintenanceApi},
    context::Context,
};

/// The state both subsystems must report.
pub const DRAINED: &str = "DRAINED";

/// The drain state of both subsystems as read from one status document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainState {
    /// The value of `db-state`.
    pub db_state: String,

    /// The value of `scm-state`.
    pub scm_state: String,
}

impl DrainState {
    /// Read the state fields from a maintenance status document. Missing fields read as empty.
    pub fn from_status(status: &Value) -> Self {
        Self {
            db_state: field(status, "db-state"),
            scm_state: field(status, "scm-state"),
        }
    }

    /// If both subsystems are drained.
    pub fn is_drained(&self) -> bool {
        is_keyword(&self.db_state, DRAINED) && is_keyword(&self.scm_state, DRAINED)
    }
}

fn field(status: &Value, name: &str) -> String {
    match status.get(name) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn is_keyword(value: &str, keyword: &str) -> bool {
    value
        .trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .eq_ignore_ascii_case(keyword)
}

/// Poll the maintenance status every `interval` until both subsystems are drained.
///
/// Returns the number of polls made. Failed status requests are logged and retried.
pub fn wait_for_drain<A: MaintenanceApi>(
    context: &Context,
    api: &A,
    lock: &LockToken,
    interval: Duration,
    deadline: &Deadline,
    cancellation: &Cancellation,
) -> Result<u32, DrainError> {
    let mut polls = 0;

    loop {
        if cancellation.is_cancelled() {
            return Err(DrainError::Cancelled);
        }
        if deadline.is_expired() {
            return Err(DrainError::Timeout(deadline.elapsed()));
        }

        polls += 1;
        match api.maintenance_status(lock) {
            Ok(status) => {
                let state = DrainState::from_status(&status);
                if state.is_drained() {
                    info!("{context}Drained after {polls} poll(s)");
                    return Ok(polls);
                }

                info!(
                    "{context}Waiting, db-state: '{}', scm-state: '{}'",
                    state.db_state, state.scm_state
                );
            }
            Err(e) => warn!("{context}Could not fetch maintenance status: {e}"),
        }

        if !cancellation.sleep(interval) {
            return Err(DrainError::Cancelled);
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DrainError {
    #[error("Timed out after {0:?} waiting for the server to drain")]
    Timeout(Duration),

    #[error("Cancelled while waiting for the server to drain")]
    Cancelled,
}
