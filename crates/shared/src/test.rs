//! # test
//! Helpers for testing
//!

use std::io;

use tracing::{Level, subscriber::set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, registry};

/// Create and set the global test logger.
///
/// Returns `None` if another test in the same binary already set it.
pub fn init_test_logger() -> Option<WorkerGuard> {
    let filter = tracing_subscriber::filter::Targets::new().with_default(Level::TRACE);

    // Std layer
    let (std_guard, std_layer) = {
        let (writer, guard) = tracing_appender::non_blocking(io::stdout());

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(true)
            .with_target(false);

        (guard, layer)
    };

    // Create registry
    let registry = registry().with(std_layer).with(filter);

    // Set global subscriber
    set_global_default(registry).ok()?;

    Some(std_guard)
}
