//! The backup's phases, run in order and stopping at the first failure.
//!
//! Once the maintenance lock is acquired it is released on every exit path:
//! explicitly after the last phase or a failed one, by the lock guard while
//! unwinding, or by the signal listener.
//!

use core::{fmt, time::Duration};
use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;
use tracing::{error, info};

use crate::{
    Settings, Tuning,
    cancellation::{Cancellation, Deadline},
    capability::{CapabilityError, CapabilityProbe, check_capabilities},
    client::{ApiError, BackupToken, MaintenanceApi},
    config::{Arguments, ConfigError},
    context::Context,
    drain::{DrainError, wait_for_drain},
    lock::{CrashRecovery, MaintenanceLock, SignalListener},
    monitor::monitor_transfer,
    transfer::{TransferEngine, TransferError},
};

/// The phases of a backup, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Checking required commands exist.
    CapabilityCheck,

    /// Resolving settings.
    Configuration,

    /// Checking the server can be reached.
    Connectivity,

    /// Acquiring the maintenance lock.
    LockAcquire,

    /// Telling the server a backup started.
    BackupStart,

    /// Waiting for the server to drain.
    DrainWait,

    /// Copying files.
    Transfer,

    /// Releasing the maintenance lock.
    LockRelease,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CapabilityCheck => "Capability Check",
            Self::Configuration => "Configuration",
            Self::Connectivity => "Connectivity",
            Self::LockAcquire => "Lock Acquire",
            Self::BackupStart => "Backup Start",
            Self::DrainWait => "Drain Wait",
            Self::Transfer => "Transfer",
            Self::LockRelease => "Lock Release",
        };

        f.write_str(name)
    }
}

/// The polling cadence and limits for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Time between polls.
    pub poll_interval: Duration,

    /// How long to wait for the server to drain.
    pub drain_timeout: Option<Duration>,

    /// How long to wait for the transfer.
    pub transfer_timeout: Option<Duration>,
}

impl From<&Tuning> for Timing {
    fn from(tuning: &Tuning) -> Self {
        Self {
            poll_interval: tuning.poll_interval(),
            drain_timeout: tuning.drain_timeout(),
            transfer_timeout: tuning.transfer_timeout(),
        }
    }
}

/// The result of a successful backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// The backup's identifier on the server.
    pub backup_token: BackupToken,

    /// How many status polls it took for the server to drain.
    pub drain_polls: u32,

    /// Every percentage reported during the transfer.
    pub reported: Vec<u8>,

    /// Where the transfer log was kept.
    pub log_file: Option<PathBuf>,
}

/// Runs the phases of a backup from connectivity check to lock release.
pub struct Orchestrator<A: MaintenanceApi, E: TransferEngine> {
    api: Arc<A>,
    engine: E,
    recovery: CrashRecovery<A>,
    cancellation: Cancellation,
    timing: Timing,
    context: Context,
    signal_listener: Option<SignalListener>,
}

impl<A: MaintenanceApi, E: TransferEngine> Orchestrator<A, E> {
    /// Create an orchestrator driving `api` and `engine`.
    pub fn new(api: Arc<A>, engine: E, timing: Timing, context: Context) -> Self {
        Self {
            recovery: CrashRecovery::new(Arc::clone(&api)),
            api,
            engine,
            cancellation: Cancellation::new(),
            timing,
            context,
            signal_listener: None,
        }
    }

    /// A handle that stops the polling loops.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// A handle that releases the lock while one is held.
    pub fn recovery(&self) -> CrashRecovery<A> {
        self.recovery.clone()
    }

    /// The transfer engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run every phase. The lock, once acquired, is always released.
    pub fn run(&mut self) -> Result<BackupReport, BackupError> {
        self.enter(Phase::Connectivity);
        self.api
            .connectivity_check()
            .map_err(BackupError::Connectivity)?;

        self.enter(Phase::LockAcquire);
        let lock = MaintenanceLock::acquire(&self.recovery).map_err(BackupError::LockAcquire)?;
        info!("{}Acquired maintenance lock {}", self.context, lock.token());

        let outcome = self.run_locked(&lock);

        self.enter(Phase::LockRelease);
        match (outcome, lock.release()) {
            (Ok(report), Ok(())) => {
                info!("{}Released maintenance lock", self.context);
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(BackupError::Unlock(e)),
            (Err(error), release) => {
                if let Err(e) = release {
                    error!("{}Could not release maintenance lock: {e}", self.context);
                }
                Err(error)
            }
        }
    }

    fn run_locked(&mut self, lock: &MaintenanceLock<A>) -> Result<BackupReport, BackupError> {
        self.enter(Phase::BackupStart);
        let backup_token = self
            .api
            .backup_start(lock.token())
            .map_err(BackupError::BackupStart)?;
        info!("{}Started backup {backup_token}", self.context);

        self.enter(Phase::DrainWait);
        let drain_polls = wait_for_drain(
            &self.context,
            self.api.as_ref(),
            lock.token(),
            self.timing.poll_interval,
            &Deadline::after(self.timing.drain_timeout),
            &self.cancellation,
        )?;

        self.enter(Phase::Transfer);
        let summary = monitor_transfer(
            &self.context,
            self.api.as_ref(),
            &mut self.engine,
            lock.token(),
            self.timing.poll_interval,
            &Deadline::after(self.timing.transfer_timeout),
            &self.cancellation,
        )?;

        Ok(BackupReport {
            backup_token,
            drain_polls,
            reported: summary.reported,
            log_file: summary.log_file,
        })
    }

    fn enter(&mut self, phase: Phase) {
        self.context.enter(phase);
    }
}

impl<A, E> Orchestrator<A, E>
where
    A: MaintenanceApi + Send + Sync + 'static,
    E: TransferEngine,
{
    /// Release the lock and exit when the process is asked to terminate.
    /// The run gets `grace` to stop and release the lock itself first.
    pub fn listen_for_signals(&mut self, grace: Duration) -> Result<(), BackupError> {
        let listener = SignalListener::spawn(self.recovery(), self.cancellation(), grace)
            .map_err(BackupError::Signals)?;
        self.signal_listener = Some(listener);
        Ok(())
    }
}

/// Run a whole backup from the command line arguments: check `required` commands, resolve
/// settings, then build an orchestrator with `build` and run it.
pub fn execute<P, A, E, F>(
    arguments: &[String],
    probe: &P,
    required: &[&str],
    build: F,
) -> Result<BackupReport, BackupError>
where
    P: CapabilityProbe,
    A: MaintenanceApi,
    E: TransferEngine,
    F: FnOnce(&Settings, &Tuning) -> Result<Orchestrator<A, E>, BackupError>,
{
    let mut context = Context::unresolved();

    context.enter(Phase::CapabilityCheck);
    check_capabilities(probe, required)?;

    context.enter(Phase::Configuration);
    let (settings, tuning) = Settings::resolve(Arguments::parse(arguments)?)?;

    let mut context = Context::new(&settings.server_url);
    context.phase = Phase::Configuration;
    info!(
        "{context}Backing up from {:?} to {:?} as {}",
        settings.transfer_source_path,
        settings.transfer_dest_path,
        settings.server_user
    );

    let mut orchestrator = build(&settings, &tuning)?;
    orchestrator.run()
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    CapabilityMissing(#[from] CapabilityError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Failed to create the REST client: {0}")]
    Client(#[source] ApiError),

    #[error("Failed to listen for signals: {0}")]
    Signals(#[source] io::Error),

    #[error("Could not reach the server: {0}")]
    Connectivity(#[source] ApiError),

    #[error("Could not acquire the maintenance lock: {0}")]
    LockAcquire(#[source] ApiError),

    #[error("Could not start the backup: {0}")]
    BackupStart(#[source] ApiError),

    #[error(transparent)]
    Drain(#[from] DrainError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Could not release the maintenance lock: {0}")]
    Unlock(#[source] ApiError),
}

impl BackupError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CapabilityMissing(error) => u8::try_from(error.missing.len())
                .unwrap_or(u8::MAX)
                .max(1),
            _ => 1,
        }
    }

    /// If usage text should accompany this error.
    pub fn shows_usage(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// If the backup stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Drain(DrainError::Cancelled) | Self::Transfer(TransferError::Cancelled)
        )
    }
}
