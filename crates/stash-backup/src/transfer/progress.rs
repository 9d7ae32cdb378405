//! Progress parsing and normalisation for rsync's `--progress` output.
//!
//! rsync reports how many items are left to check as `to-chk=N/M`, or
//! `ir-chk=N/M` while incremental recursion is still enumerating files. The
//! enumeration half is mapped to 0-50% and the checking half to 50-100%.
//!

use std::{
    fs::File,
    io::{self, ErrorKind, Read, Seek, SeekFrom},
    path::PathBuf,
};

/// Which half of the transfer a progress line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    /// Still enumerating the file list (`ir-chk`).
    Enumerating,

    /// File list complete, checking and transferring (`to-chk`).
    Checking,
}

/// Items remaining out of a total, as reported by the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRatio {
    /// The half of the transfer this ratio belongs to.
    pub phase: ProgressPhase,

    /// Items still remaining.
    pub remaining: u64,

    /// Items in total.
    pub total: u64,
}

impl ProgressRatio {
    /// Create a new ratio.
    pub fn new(phase: ProgressPhase, remaining: u64, total: u64) -> Self {
        Self {
            phase,
            remaining,
            total,
        }
    }

    /// The fraction of work remaining, `0.0` if the total is unknown.
    #[allow(clippy::as_conversions)]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        (self.remaining.min(self.total) as f64) / (self.total as f64)
    }

    /// The ratio as a percentage complete.
    pub fn percentage(&self) -> u8 {
        normalize(self.phase, self.ratio())
    }

    /// Parse the last progress marker in a line of rsync output.
    pub fn parse_line(line: &str) -> Option<Self> {
        const MARKERS: [(&str, ProgressPhase); 3] = [
            ("to-chk=", ProgressPhase::Checking),
            ("to-check=", ProgressPhase::Checking),
            ("ir-chk=", ProgressPhase::Enumerating),
        ];

        let (start, marker, phase) = MARKERS
            .iter()
            .filter_map(|(marker, phase)| {
                line.rfind(marker).map(|start| (start, *marker, *phase))
            })
            .max_by_key(|(start, _, _)| *start)?;

        let rest = line.get(start + marker.len()..)?;
        let (remaining, rest) = rest.split_once('/')?;
        let total: String = rest.chars().take_while(char::is_ascii_digit).collect();

        let remaining = remaining.trim().parse().ok()?;
        let total = total.parse().ok()?;

        Some(Self::new(phase, remaining, total))
    }
}

/// Map a remaining ratio to a whole percentage complete in `[0, 100]`.
///
/// Enumeration covers `50 - 50r`, checking covers `50 - 50r + 50`.
#[allow(clippy::as_conversions)]
pub fn normalize(phase: ProgressPhase, ratio: f64) -> u8 {
    let percentage = match phase {
        ProgressPhase::Enumerating => 50.0 - 50.0 * ratio,
        ProgressPhase::Checking => 50.0 - 50.0 * ratio + 50.0,
    };

    if percentage.is_nan() {
        return 0;
    }

    percentage.round().clamp(0.0, 100.0) as u8
}

/// Follows a growing log file, remembering the latest progress line seen.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    latest: Option<ProgressRatio>,
}

impl LogTail {
    /// Follow the log at `path`. The file need not exist yet.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
            latest: None,
        }
    }

    /// Read anything appended since the last poll and return the latest progress.
    pub fn poll(&mut self) -> io::Result<Option<ProgressRatio>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(self.latest),
            Err(e) => return Err(e),
        };

        file.seek(SeekFrom::Start(self.offset))?;
        let mut appended = Vec::new();
        let read = file.read_to_end(&mut appended)?;
        self.offset += u64::try_from(read).unwrap_or(u64::MAX);

        self.partial.extend_from_slice(&appended);

        // Progress updates are terminated by '\r', everything else by '\n'.
        let Some(last_terminator) = self
            .partial
            .iter()
            .rposition(|byte| *byte == b'\r' || *byte == b'\n')
        else {
            return Ok(self.latest);
        };

        let remainder = self.partial.split_off(last_terminator + 1);
        let complete = core::mem::replace(&mut self.partial, remainder);

        if let Some(ratio) = complete
            .split(|byte| *byte == b'\r' || *byte == b'\n')
            .filter_map(|line| ProgressRatio::parse_line(&String::from_utf8_lossy(line)))
            .last()
        {
            self.latest = Some(ratio);
        }

        Ok(self.latest)
    }
}

#[cfg(test)]
mod test {
    use std::{fs::OpenOptions, io::Write};

    use super::{LogTail, ProgressPhase, ProgressRatio, normalize};

    #[test]
    fn normalisation_of_the_checking_half() {
        assert_eq!(normalize(ProgressPhase::Checking, 0.0), 100);
        assert_eq!(normalize(ProgressPhase::Checking, 0.5), 75);
        assert_eq!(normalize(ProgressPhase::Checking, 0.8), 60);
        assert_eq!(normalize(ProgressPhase::Checking, 0.4), 80);
        assert_eq!(normalize(ProgressPhase::Checking, 1.0), 50);
    }

    #[test]
    fn normalisation_of_the_enumeration_half() {
        assert_eq!(normalize(ProgressPhase::Enumerating, 1.0), 0);
        assert_eq!(normalize(ProgressPhase::Enumerating, 0.0), 50);
    }

    #[test]
    fn normalisation_is_stable() {
        let ratio = 2.0 / 3.0;
        assert_eq!(
            normalize(ProgressPhase::Checking, ratio),
            normalize(ProgressPhase::Checking, ratio)
        );
        assert_eq!(normalize(ProgressPhase::Checking, ratio), 67);
    }

    #[test]
    fn out_of_range_is_clamped() {
        assert_eq!(normalize(ProgressPhase::Checking, -1.0), 100);
        assert_eq!(normalize(ProgressPhase::Enumerating, 3.0), 0);
        assert_eq!(normalize(ProgressPhase::Checking, f64::NAN), 0);
    }

    #[test]
    fn parses_to_chk() {
        let line = "      2,048 100%    1.95MB/s    0:00:00 (xfr#12, to-chk=345/1380)";
        let ratio = ProgressRatio::parse_line(line).unwrap();
        assert_eq!(ratio, ProgressRatio::new(ProgressPhase::Checking, 345, 1380));
        assert_eq!(ratio.percentage(), 88);
    }

    #[test]
    fn parses_legacy_to_check() {
        let line = "  100  100%  0.00kB/s  0:00:00 (xfer#1, to-check=9/10)";
        let ratio = ProgressRatio::parse_line(line).unwrap();
        assert_eq!(ratio, ProgressRatio::new(ProgressPhase::Checking, 9, 10));
    }

    #[test]
    fn parses_ir_chk() {
        let line = "  512 100%  0.00kB/s  0:00:00 (xfr#3, ir-chk=1020/1031)";
        let ratio = ProgressRatio::parse_line(line).unwrap();
        assert_eq!(ratio.phase, ProgressPhase::Enumerating);
    }

    #[test]
    fn ignores_other_lines() {
        assert!(ProgressRatio::parse_line("sending incremental file list").is_none());
        assert!(ProgressRatio::parse_line("shared/data/repositories/1/objects").is_none());
        assert!(ProgressRatio::parse_line("(xfr#1, to-chk=").is_none());
    }

    #[test]
    fn zero_total_is_complete() {
        let ratio = ProgressRatio::new(ProgressPhase::Checking, 0, 0);
        assert_eq!(ratio.percentage(), 100);
    }

    #[test]
    fn tail_follows_appended_output() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("rsync.log");
        let mut tail = LogTail::new(path.clone());

        assert_eq!(tail.poll().unwrap(), None);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();

        write!(
            file,
            "sending incremental file list\nrepositories/1/\n  1 0%  0.00kB/s  0:00:00\r  1 100%  0.00kB/s  0:00:00 (xfr#1, to-chk=8/10)\r"
        )
        .unwrap();
        file.flush().unwrap();
        let ratio = tail.poll().unwrap().unwrap();
        assert_eq!(ratio.remaining, 8);

        // A half written line is not parsed until it is terminated.
        write!(file, "  2 100%  0.00kB/s  0:00:00 (xfr#2, to-chk=4/1").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.poll().unwrap().unwrap().remaining, 8);

        writeln!(file, "0)").unwrap();
        file.flush().unwrap();
        let ratio = tail.poll().unwrap().unwrap();
        assert_eq!(ratio, ProgressRatio::new(ProgressPhase::Checking, 4, 10));
    }
}
