//! Context for the current backup. Used for prefixing logs.
//!

use core::fmt;

use tracing::info;

use crate::Phase;

/// Holds the context for the current backup.
#[derive(Debug, Clone)]
pub struct Context {
    /// The server being backed up.
    pub server: String,

    /// The phase currently running.
    pub phase: Phase,
}

impl Context {
    /// Create a context for a server, starting at the first phase.
    pub fn new(server: &str) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            phase: Phase::CapabilityCheck,
        }
    }

    /// A context for the phases before the server is known.
    pub fn unresolved() -> Self {
        Self::new("unresolved")
    }

    /// Move to `phase` and log it.
    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!("{self}Starting");
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] [{}] ", self.server, self.phase)
    }
}
