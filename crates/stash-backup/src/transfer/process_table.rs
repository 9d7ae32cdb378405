use std::ffi::OsString;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// The operating system's process table.
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    /// Create an empty table, it is refreshed on every query.
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// If a process named `command` is running with every one of `needles` in its arguments.
    pub fn contains(&mut self, command: &str, needles: &[&str]) -> bool {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
        );

        self.system.processes().values().any(|process| {
            let name = process.name().to_string_lossy();
            let arguments: Vec<String> = process
                .cmd()
                .iter()
                .map(OsString::as_os_str)
                .map(|argument| argument.to_string_lossy().into_owned())
                .collect();

            command_line_matches(&name, &arguments, command, needles)
        })
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// If a process with `name` and `arguments` is `command` working on every one of `needles`.
pub fn command_line_matches(
    name: &str,
    arguments: &[String],
    command: &str,
    needles: &[&str],
) -> bool {
    if name != command {
        return false;
    }

    needles
        .iter()
        .all(|needle| arguments.iter().any(|argument| argument.contains(needle)))
}

#[cfg(test)]
mod test {
    use super::command_line_matches;

    fn arguments(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn matches_the_copy() {
        let line = arguments("rsync -a --delete --progress /srv/stash /backup/stash");
        assert!(command_line_matches(
            "rsync",
            &line,
            "rsync",
            &["/srv/stash", "/backup/stash"]
        ));
    }

    #[test]
    fn other_copies_do_not_match() {
        let line = arguments("rsync -a /srv/other /backup/other");
        assert!(!command_line_matches(
            "rsync",
            &line,
            "rsync",
            &["/srv/stash", "/backup/stash"]
        ));
    }

    #[test]
    fn orchestrator_arguments_do_not_match() {
        let line = arguments("stash-backup rsync_src=/srv/stash rsync_dest=/backup/stash");
        assert!(!command_line_matches(
            "stash-backup",
            &line,
            "rsync",
            &["/srv/stash", "/backup/stash"]
        ));
    }
}
