//! Maintenance lock handling
//!
//! The lock is held by a [`MaintenanceLock`] guard. While it is held, its token
//! also sits in a [`CrashRecovery`] slot so the lock can be released from a
//! signal handler or while unwinding, not only on the happy path.
//!

use core::time::Duration;
use std::{
    io,
    process,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle, sleep},
    time::Instant,
};

use signal_hook::{
    consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM},
    iterator::{Handle, Signals},
};
use tracing::{error, info, warn};

use crate::{
    cancellation::Cancellation,
    client::{ApiError, LockToken, MaintenanceApi},
};

/// The outcome of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No lock was held.
    NotHeld,

    /// The held lock was released.
    Released,

    /// Releasing the held lock failed.
    Failed,
}

/// Holds the token of the currently held lock so it can be released on abnormal exit.
pub struct CrashRecovery<A> {
    api: Arc<A>,
    slot: Arc<Mutex<Slot>>,
}

#[derive(Default)]
struct Slot {
    held: Option<LockToken>,
    releasing: bool,
}

impl<A> Clone for CrashRecovery<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<A: MaintenanceApi> CrashRecovery<A> {
    /// Create an unarmed recovery handle.
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// The API recovery releases through.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Register `token` as held.
    pub fn arm(&self, token: LockToken) {
        self.slot().held = Some(token);
    }

    /// If a token is held.
    pub fn is_armed(&self) -> bool {
        self.slot().held.is_some()
    }

    /// If a token is held or a release request is still in flight.
    pub fn is_pending(&self) -> bool {
        let slot = self.slot();
        slot.held.is_some() || slot.releasing
    }

    /// Release the held lock, if any. Safe to call any number of times from any thread,
    /// only the first caller to observe the token attempts the release.
    pub fn recover(&self) -> Recovery {
        let Some(token) = self.begin_release() else {
            return Recovery::NotHeld;
        };

        warn!("Recovering maintenance lock {token}");
        let result = self.api.lock_release(&token);
        self.end_release();

        match result {
            Ok(()) => {
                info!("Recovery released maintenance lock {token}");
                Recovery::Released
            }
            Err(e) => {
                error!("Recovery could not release maintenance lock {token}: {e}");
                Recovery::Failed
            }
        }
    }

    /// Take the held token and mark a release as in flight until [`Self::end_release`].
    fn begin_release(&self) -> Option<LockToken> {
        let mut slot = self.slot();
        let token = slot.held.take()?;
        slot.releasing = true;
        Some(token)
    }

    fn end_release(&self) {
        self.slot().releasing = false;
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot still holds a valid token.
        match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A held maintenance lock. Released by [`MaintenanceLock::release`], or by recovery when
/// dropped unreleased.
pub struct MaintenanceLock<A: MaintenanceApi> {
    recovery: CrashRecovery<A>,
    token: LockToken,
    released: bool,
}

impl<A: MaintenanceApi> MaintenanceLock<A> {
    /// Acquire the lock and arm `recovery` with its token.
    pub fn acquire(recovery: &CrashRecovery<A>) -> Result<Self, ApiError> {
        let token = recovery.api().lock_acquire()?;
        recovery.arm(token.clone());

        Ok(Self {
            recovery: recovery.clone(),
            token,
            released: false,
        })
    }

    /// The lock's token.
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release the lock and disarm recovery.
    ///
    /// On failure recovery is re-armed, so dropping the guard tries once more.
    pub fn release(mut self) -> Result<(), ApiError> {
        let Some(token) = self.recovery.begin_release() else {
            // Already released by recovery.
            self.released = true;
            return Ok(());
        };

        let result = self.recovery.api().lock_release(&token);
        if result.is_err() {
            self.recovery.arm(token);
        } else {
            self.released = true;
        }
        self.recovery.end_release();

        result
    }
}

impl<A: MaintenanceApi> Drop for MaintenanceLock<A> {
    fn drop(&mut self) {
        if !self.released {
            self.recovery.recover();
        }
    }
}

/// Listens for termination signals and releases the held lock before exiting.
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// The signals treated as a request to terminate.
    pub const SIGNALS: [i32; 4] = [SIGINT, SIGTERM, SIGHUP, SIGQUIT];

    /// Start listening. On a signal `cancellation` is cancelled, the main thread gets up
    /// to `grace` to release the lock itself, then recovery runs and the process exits.
    pub fn spawn<A>(
        recovery: CrashRecovery<A>,
        cancellation: Cancellation,
        grace: Duration,
    ) -> io::Result<Self>
    where
        A: MaintenanceApi + Send + Sync + 'static,
    {
        let mut signals = Signals::new(Self::SIGNALS)?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    warn!("Received signal {signal}, stopping backup");
                    handle_signal(&recovery, &cancellation, grace);
                    process::exit(1);
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Signal listener thread panicked");
            }
        }
    }
}

/// Cancel the run, give it `grace` to unlock cleanly, then recover whatever is still held.
///
/// A release already in flight is waited on, so returning never cuts it short within `grace`.
pub fn handle_signal<A: MaintenanceApi>(
    recovery: &CrashRecovery<A>,
    cancellation: &Cancellation,
    grace: Duration,
) -> Recovery {
    cancellation.cancel();

    let start = Instant::now();
    while recovery.is_pending() && start.elapsed() < grace {
        sleep(Duration::from_millis(50));
    }

    if recovery.is_pending() && !recovery.is_armed() {
        warn!("Maintenance lock release still in flight after {grace:?}");
    }

    recovery.recover()
}
