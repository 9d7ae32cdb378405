//! # stash-backup
//! Locks a Stash server, copies its home directory while reporting progress, then unlocks it.
//!

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use core::time::Duration;
use std::{fs, path::Path, process::ExitCode, sync::Arc};

use mimalloc::MiMalloc;
use shared::{Failure, init_logger};
use stash_backup::{
    BackupError, Orchestrator, RestClient, USAGE, capability::SearchPath, config::FileConfig,
    context::Context, execute, orchestrator::Timing, transfer::RsyncEngine,
};
use tracing::{error, info};

const LOG_DIRECTORY: &str = "./logs";

/// How long a terminating run gets to release the lock itself.
const SIGNAL_GRACE: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let arguments: Vec<String> = std::env::args().skip(1).collect();

    // Initialize config if args include 'init'.
    if arguments.iter().any(|arg| arg.eq("init")) {
        let contents = toml::to_string_pretty(&FileConfig::template())
            .or_log_and_panic("Could not serialize config file");
        fs::write("config.toml", contents).or_log_and_panic("Could not create config file");
        println!("Wrote config.toml");
        return ExitCode::SUCCESS;
    }

    let _logger = match init_logger(Path::new(LOG_DIRECTORY)) {
        Ok(logger) => logger,
        Err(error) => {
            eprintln!("Could not initialize logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    let result = execute(
        &arguments,
        &SearchPath,
        RsyncEngine::REQUIRED_COMMANDS,
        |settings, tuning| {
            let api = RestClient::new(settings, tuning.request_timeout())
                .map_err(BackupError::Client)?;
            let engine = RsyncEngine::new(settings, tuning);

            let mut orchestrator = Orchestrator::new(
                Arc::new(api),
                engine,
                Timing::from(tuning),
                Context::new(&settings.server_url),
            );
            orchestrator.listen_for_signals(SIGNAL_GRACE)?;

            Ok(orchestrator)
        },
    );

    match result {
        Ok(report) => {
            info!(
                "Backup {} complete, drained after {} poll(s), {} progress report(s)",
                report.backup_token,
                report.drain_polls,
                report.reported.len()
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("Backup failed: {error}");
            if error.shows_usage() {
                eprintln!("{error}\n\n{USAGE}");
            }
            ExitCode::from(error.exit_code())
        }
    }
}
