use std::{
    ffi::OsString,
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use chrono::Local;
use tracing::{debug, info, warn};

use super::{
    CopyExit, LogTail, ProgressRatio, SystemProcessTable, TransferEngine, TransferError,
};
use crate::{Settings, Tuning};

/// Copies the server's home directory with rsync, following progress through its log.
pub struct RsyncEngine {
    program: OsString,
    leading_arguments: Vec<OsString>,
    source: PathBuf,
    destination: PathBuf,
    excludes: Vec<String>,
    log_file: PathBuf,
    tail: LogTail,
    child: Option<Child>,
    exit: Option<CopyExit>,
    processes: SystemProcessTable,
}

impl RsyncEngine {
    /// The commands this engine invokes.
    pub const REQUIRED_COMMANDS: &'static [&'static str] = &["rsync"];

    const COMMAND: &'static str = "rsync";

    const LOG_PREFIX: &'static str = "stash-backup-rsync-";

    /// Create an engine for the paths in `settings`. Nothing runs until started.
    pub fn new(settings: &Settings, tuning: &Tuning) -> Self {
        let file_name = format!(
            "{}{}.log",
            Self::LOG_PREFIX,
            Local::now().format("%Y%m%d-%H%M%S")
        );
        let log_file = tuning.log_directory.join(file_name);

        Self {
            program: OsString::from(Self::COMMAND),
            leading_arguments: Vec::new(),
            source: settings.transfer_source_path.clone(),
            destination: settings.transfer_dest_path.clone(),
            excludes: tuning.rsync_excludes.clone(),
            tail: LogTail::new(log_file.clone()),
            log_file,
            child: None,
            exit: None,
            processes: SystemProcessTable::new(),
        }
    }

    /// Run `program` with `leading_arguments` in place of rsync. The rsync arguments follow
    /// the leading ones.
    pub fn with_command<I, S>(
        mut self,
        program: impl Into<OsString>,
        leading_arguments: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = program.into();
        self.leading_arguments = leading_arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Where rsync's output is written while it runs.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// The arguments rsync is invoked with.
    ///
    /// The source carries a trailing slash so its contents, not the directory itself, land in
    /// the destination. Transfer logs kept in the destination are protected from deletion.
    pub fn arguments(&self) -> Vec<OsString> {
        let mut arguments: Vec<OsString> = ["-a", "--delete", "--delete-excluded", "--progress"]
            .into_iter()
            .map(OsString::from)
            .collect();

        arguments.push(OsString::from(format!("--filter=P /{}*.log", Self::LOG_PREFIX)));

        arguments.extend(
            self.excludes
                .iter()
                .map(|pattern| OsString::from(format!("--exclude={pattern}"))),
        );

        let mut source = self.source.clone().into_os_string();
        if source.as_encoded_bytes().last() != Some(&b'/') {
            source.push("/");
        }
        arguments.push(source);
        arguments.push(self.destination.clone().into_os_string());

        arguments
    }

    fn poll_exit(&mut self) -> Result<Option<CopyExit>, TransferError> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }

        let Some(child) = self.child.as_mut() else {
            return Err(TransferError::NotStarted);
        };

        if let Some(status) = child
            .try_wait()
            .map_err(|e| TransferError::Io(e, "poll the copy process"))?
        {
            let exit = if status.success() {
                CopyExit::Success
            } else {
                CopyExit::Failed(status.code())
            };

            debug!("rsync exited: {status}");
            self.exit = Some(exit);
        }

        Ok(self.exit)
    }

    fn process_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    fn path_needles(&self) -> [String; 2] {
        [
            self.source.to_string_lossy().into_owned(),
            self.destination.to_string_lossy().into_owned(),
        ]
    }
}

impl TransferEngine for RsyncEngine {
    fn start(&mut self) -> Result<(), TransferError> {
        if let Some(directory) = self.log_file.parent() {
            fs::create_dir_all(directory)
                .map_err(|e| TransferError::Io(e, "create the transfer log directory"))?;
        }

        let stdout = File::create(&self.log_file)
            .map_err(|e| TransferError::Io(e, "create the transfer log"))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| TransferError::Io(e, "share the transfer log"))?;

        let child = Command::new(&self.program)
            .args(&self.leading_arguments)
            .args(self.arguments())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(TransferError::Spawn)?;

        info!(
            "Started {:?} (pid {}) copying {:?} to {:?}, logging to {:?}",
            self.program,
            child.id(),
            self.source,
            self.destination,
            self.log_file
        );
        self.child = Some(child);

        Ok(())
    }

    fn progress_ratio(&mut self) -> Result<Option<ProgressRatio>, TransferError> {
        self.tail
            .poll()
            .map_err(|e| TransferError::Io(e, "read the transfer log"))
    }

    fn is_running(&mut self) -> Result<bool, TransferError> {
        if self.poll_exit()?.is_none() {
            return Ok(true);
        }

        // rsync forks a receiver that can outlive the process we spawned.
        let name = self.process_name();
        let [source, destination] = self.path_needles();
        Ok(self
            .processes
            .contains(&name, &[source.as_str(), destination.as_str()]))
    }

    fn exit_status(&mut self) -> Result<Option<CopyExit>, TransferError> {
        self.poll_exit()
    }

    fn finish(&mut self) -> Result<Option<PathBuf>, TransferError> {
        let Some(file_name) = self.log_file.file_name() else {
            return Ok(None);
        };

        fs::create_dir_all(&self.destination)
            .map_err(|e| TransferError::Io(e, "create the destination directory"))?;
        let target = self.destination.join(file_name);

        if let Err(error) = fs::rename(&self.log_file, &target) {
            if error.kind() == ErrorKind::NotFound {
                warn!("Transfer log {:?} no longer exists", self.log_file);
                return Ok(None);
            }

            // Most likely a different filesystem.
            debug!("Could not rename transfer log, copying instead: {error}");
            fs::copy(&self.log_file, &target)
                .map_err(|e| TransferError::Io(e, "copy the transfer log"))?;
            fs::remove_file(&self.log_file)
                .map_err(|e| TransferError::Io(e, "remove the transfer log"))?;
        }

        info!("Transfer log kept at {target:?}");
        Ok(Some(target))
    }

    fn abort(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        if self.exit.is_some() {
            return;
        }

        warn!("Stopping rsync (pid {})", child.id());
        if let Err(e) = child.kill() {
            warn!("Could not stop rsync: {e}");
        }

        match child.wait() {
            Ok(status) => self.exit = Some(CopyExit::Failed(status.code())),
            Err(e) => warn!("Could not wait for rsync: {e}"),
        }
    }
}
