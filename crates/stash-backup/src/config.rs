//! Backup settings
//!
//! Settings are resolved from `key=value` command line arguments layered over
//! an optional TOML config file. Command line values take precedence.
//!

use core::{fmt, time::Duration};
use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Usage text printed alongside configuration errors.
pub const USAGE: &str = "\
Usage: stash-backup [init] [config=<file>] stash_user=<user> stash_user_password=<password>
                    stash_url=<url> rsync_src=<path> rsync_dest=<path>

  init                  Write a template config.toml to the current directory and exit.
  config                TOML file providing any of the keys below and a [tuning] table.
  stash_user            Administrator used for the maintenance REST calls.
  stash_user_password   Password for stash_user.
  stash_url             Base URL of the server, e.g. https://stash.example.com/
  rsync_src             The server's home directory to copy.
  rsync_dest            Where the copy and its transfer log are written.

Command line values override values from the config file.";

/// The resolved settings for a backup run.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    /// The administrator's username.
    pub server_user: String,

    /// The administrator's password.
    pub server_password: String,

    /// The server's base URL.
    pub server_url: String,

    /// The directory to copy from.
    pub transfer_source_path: PathBuf,

    /// The directory to copy to.
    pub transfer_dest_path: PathBuf,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("server_user", &self.server_user)
            .field("server_password", &"<redacted>")
            .field("server_url", &self.server_url)
            .field("transfer_source_path", &self.transfer_source_path)
            .field("transfer_dest_path", &self.transfer_dest_path)
            .finish()
    }
}

impl Settings {
    /// Resolve the settings and tuning from parsed arguments.
    pub fn resolve(arguments: Arguments) -> Result<(Self, Tuning), ConfigError> {
        let file = match &arguments.config {
            Some(path) => FileConfig::load_toml(path).map_err(|source| ConfigError::File {
                path: path.clone(),
                source,
            })?,
            None => FileConfig::default(),
        };

        let merged = arguments.values.layer_over(file.values);

        let mut missing = Vec::new();
        let mut take = |value: Option<String>, key: &'static str| -> String {
            match value {
                Some(value) if !value.trim().is_empty() => value,
                _ => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let server_user = take(merged.stash_user, "stash_user");
        let server_password = take(merged.stash_user_password, "stash_user_password");
        let server_url = take(merged.stash_url, "stash_url");
        let transfer_source_path = take(merged.rsync_src, "rsync_src");
        let transfer_dest_path = take(merged.rsync_dest, "rsync_dest");

        if !missing.is_empty() {
            return Err(ConfigError::Incomplete { missing });
        }

        let settings = Self {
            server_user,
            server_password,
            server_url,
            transfer_source_path: PathBuf::from(transfer_source_path),
            transfer_dest_path: PathBuf::from(transfer_dest_path),
        };

        Ok((settings, file.tuning))
    }
}

/// The values that may be given either on the command line or in the config file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingValues {
    /// Maps to [`Settings::server_user`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash_user: Option<String>,

    /// Maps to [`Settings::server_password`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash_user_password: Option<String>,

    /// Maps to [`Settings::server_url`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash_url: Option<String>,

    /// Maps to [`Settings::transfer_source_path`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsync_src: Option<String>,

    /// Maps to [`Settings::transfer_dest_path`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsync_dest: Option<String>,
}

impl SettingValues {
    /// Fill any value missing from `self` with the value from `defaults`. Blank values count
    /// as missing.
    pub fn layer_over(self, defaults: Self) -> Self {
        Self {
            stash_user: present(self.stash_user).or(defaults.stash_user),
            stash_user_password: present(self.stash_user_password)
                .or(defaults.stash_user_password),
            stash_url: present(self.stash_url).or(defaults.stash_url),
            rsync_src: present(self.rsync_src).or(defaults.rsync_src),
            rsync_dest: present(self.rsync_dest).or(defaults.rsync_dest),
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// The parsed command line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Arguments {
    /// The config file to load, if any.
    pub config: Option<PathBuf>,

    /// The values given on the command line.
    pub values: SettingValues,
}

impl Arguments {
    /// Parse unordered `key=value` arguments. The program name must not be included.
    pub fn parse<I, S>(arguments: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();

        for argument in arguments {
            let argument = argument.as_ref();
            let (key, value) = argument
                .split_once('=')
                .ok_or_else(|| ConfigError::UnknownArgument(argument.to_string()))?;
            let value = value.to_string();

            match key {
                "config" => parsed.config = Some(PathBuf::from(value)),
                "stash_user" => parsed.values.stash_user = Some(value),
                "stash_user_password" => parsed.values.stash_user_password = Some(value),
                "stash_url" => parsed.values.stash_url = Some(value),
                "rsync_src" => parsed.values.rsync_src = Some(value),
                "rsync_dest" => parsed.values.rsync_dest = Some(value),
                _ => return Err(ConfigError::UnknownArgument(key.to_string())),
            }
        }

        Ok(parsed)
    }
}

/// Timing and transfer knobs, read from the `[tuning]` table of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Seconds between polls of the drain state and the transfer progress.
    pub poll_interval_seconds: u64,

    /// Seconds to wait for the server to drain. `0` waits forever.
    pub drain_timeout_seconds: u64,

    /// Seconds to wait for the transfer to complete. `0` waits forever.
    pub transfer_timeout_seconds: u64,

    /// Seconds before a REST request is abandoned.
    pub request_timeout_seconds: u64,

    /// Where the transfer log is written while the copy runs.
    pub log_directory: PathBuf,

    /// Patterns passed to rsync as `--exclude`.
    pub rsync_excludes: Vec<String>,
}

impl Tuning {
    /// The interval between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// The drain timeout, if enabled.
    pub fn drain_timeout(&self) -> Option<Duration> {
        non_zero_seconds(self.drain_timeout_seconds)
    }

    /// The transfer timeout, if enabled.
    pub fn transfer_timeout(&self) -> Option<Duration> {
        non_zero_seconds(self.transfer_timeout_seconds)
    }

    /// The per request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 2,
            drain_timeout_seconds: 60 * 60,
            transfer_timeout_seconds: 0,
            request_timeout_seconds: 30,
            log_directory: PathBuf::from("./logs"),
            rsync_excludes: [
                "/caches/",
                "/data/db.*",
                "/export/",
                "/log/",
                "/plugins/.*/",
                "/tmp",
                "/.lock",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

fn non_zero_seconds(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// The config file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Setting values, overridden by the command line.
    #[serde(flatten)]
    pub values: SettingValues,

    /// Timing and transfer knobs.
    pub tuning: Tuning,
}

impl FileConfig {
    /// Tries to load a config from a toml file.
    pub fn load_toml(file_path: &Path) -> Result<Self, LoadConfigError> {
        if !file_path.exists() {
            return Err(LoadConfigError::NoFile);
        }

        let contents = fs::read_to_string(file_path).map_err(LoadConfigError::Read)?;
        let config = toml::from_str(&contents)?;

        Ok(config)
    }

    /// A config with placeholder values, written by `init`.
    pub fn template() -> Self {
        Self {
            values: SettingValues {
                stash_user: Some("admin".to_string()),
                stash_user_password: Some("changeme".to_string()),
                stash_url: Some("http://localhost:7990/".to_string()),
                rsync_src: Some("/var/atlassian/application-data/stash".to_string()),
                rsync_dest: Some("/backup/stash".to_string()),
            },
            tuning: Tuning::default(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("The file does not exist.")]
    NoFile,

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to deserialize the file:\n{0}")]
    Deserialize(#[from] toml::de::Error),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown argument '{0}'")]
    UnknownArgument(String),

    #[error("Could not load config file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: LoadConfigError,
    },

    #[error("Insufficient arguments, missing: {}", .missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },
}
