//! Checks the external commands a backup needs are callable.
//!

use thiserror::Error;
use tracing::{debug, error};

/// Something that can tell if a command is available.
pub trait CapabilityProbe {
    /// If `command` can be invoked.
    fn is_available(&self, command: &str) -> bool;
}

/// Resolves commands via the `PATH` environment variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchPath;

impl CapabilityProbe for SearchPath {
    fn is_available(&self, command: &str) -> bool {
        match which::which(command) {
            Ok(path) => {
                debug!("Found '{command}' at {path:?}");
                true
            }
            Err(_) => false,
        }
    }
}

/// Verify every command in `commands` is available.
pub fn check_capabilities<P: CapabilityProbe>(
    probe: &P,
    commands: &[&str],
) -> Result<(), CapabilityError> {
    let missing: Vec<String> = commands
        .iter()
        .filter(|command| !probe.is_available(command))
        .map(|command| {
            error!("Required command '{command}' is not available");
            command.to_string()
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CapabilityError { missing })
    }
}

/// One or more required commands could not be found.
#[derive(Debug, Error)]
#[error("Missing {} required command(s): {}", .missing.len(), .missing.join(", "))]
pub struct CapabilityError {
    /// The commands that could not be found.
    pub missing: Vec<String>,
}
