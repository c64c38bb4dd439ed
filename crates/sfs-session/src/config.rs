//! Session configuration, loadable from TOML.

use crate::SessionError;
use serde::{Deserialize, Serialize};
use sfs_types::{DAEMON_MODE_FLAG, DEFAULT_MOUNTPOINT, EXIT_FILE_NAME, PACKAGE_FILE_NAME};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Address the companion listens on for the host connection.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7735";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideloadConfig {
    pub mountpoint: PathBuf,
    pub package_name: String,
    pub exit_name: String,
    /// Delay between checks for the package file.
    pub poll_interval_ms: u64,
    /// Checks before giving up on the host.
    pub max_polls: u32,
    /// How long the companion gets to exit on its own after the exit
    /// sentinel is touched, before it is killed.
    pub reap_grace_ms: u64,
    /// Companion executable; the running executable when unset.
    pub companion_program: Option<PathBuf>,
    pub companion_args: Vec<String>,
    /// Memory left untouched when sizing the block cache, in bytes.
    pub memory_reserve: u64,
    pub listen_addr: String,
    /// File receiving "1"/"0" while teardown is in progress.
    pub perf_mode_path: Option<PathBuf>,
    pub stop_transport_command: Vec<String>,
    pub enable_transport_command: Vec<String>,
    /// Program run with the package path appended.
    pub installer_command: Vec<String>,
    pub install_log: PathBuf,
}

impl Default for SideloadConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from(DEFAULT_MOUNTPOINT),
            package_name: PACKAGE_FILE_NAME.to_owned(),
            exit_name: EXIT_FILE_NAME.to_owned(),
            poll_interval_ms: 1000,
            max_polls: 300,
            reap_grace_ms: 2000,
            companion_program: None,
            companion_args: vec![DAEMON_MODE_FLAG.to_owned()],
            memory_reserve: 256 * 1024 * 1024,
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            perf_mode_path: None,
            stop_transport_command: Vec::new(),
            enable_transport_command: Vec::new(),
            installer_command: Vec::new(),
            install_log: PathBuf::from("/tmp/sideload-install.log"),
        }
    }
}

impl SideloadConfig {
    /// Read a TOML file; absent keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| SessionError::Config {
            path: path.to_owned(),
            detail: err.to_string(),
        })?;
        Self::from_toml(&text).map_err(|err| match err {
            SessionError::Config { detail, .. } => SessionError::Config {
                path: path.to_owned(),
                detail,
            },
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, SessionError> {
        let config: Self = toml::from_str(text).map_err(|err| SessionError::Config {
            path: PathBuf::new(),
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SessionError> {
        let invalid = |detail: &str| SessionError::Config {
            path: PathBuf::new(),
            detail: detail.to_owned(),
        };
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        for (field, name) in [("package_name", &self.package_name), ("exit_name", &self.exit_name)] {
            if name.is_empty() || name.contains('/') {
                return Err(invalid(&format!("{field} must be a plain file name")));
            }
        }
        if self.package_name == self.exit_name {
            return Err(invalid("package_name and exit_name must differ"));
        }
        Ok(())
    }

    #[must_use]
    pub fn package_path(&self) -> PathBuf {
        self.mountpoint.join(&self.package_name)
    }

    #[must_use]
    pub fn exit_path(&self) -> PathBuf {
        self.mountpoint.join(&self.exit_name)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn reap_grace(&self) -> Duration {
        Duration::from_millis(self.reap_grace_ms)
    }

    /// Command that launches the companion daemon.
    pub fn companion_command(&self) -> std::io::Result<Command> {
        let program = match &self.companion_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let mut command = Command::new(program);
        command.args(&self.companion_args);
        Ok(command)
    }
}
