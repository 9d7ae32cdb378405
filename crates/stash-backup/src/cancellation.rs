//! Cooperative cancellation and deadlines for the polling loops.
//!

use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{sync::Arc, thread::sleep, time::Instant};

/// The longest a cancellable sleep blocks before checking for cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// A cancellation flag shared between the polling loops and whoever may stop them.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    /// Create a new, uncancelled, instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// If cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until cancelled.
    /// Returns `false` if cancellation was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let start = Instant::now();

        loop {
            if self.is_cancelled() {
                return false;
            }

            let remaining = duration.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return true;
            }

            sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// An optional point in time after which a loop should give up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    /// A deadline `timeout` from now, or no deadline if `None`.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    /// If the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.timeout
            .is_some_and(|timeout| self.started.elapsed() >= timeout)
    }

    /// How long since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
