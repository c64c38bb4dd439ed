//! Command-backed implementations of the device and installer seams.

use crate::{DeviceHooks, PackageInstaller, ResultCode, SideloadConfig};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

fn run_command(argv: &[String]) -> io::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()?;
    if status.success() {
        debug!(program = %program, "hook command finished");
        Ok(())
    } else {
        Err(io::Error::other(format!("{program} exited with {status}")))
    }
}

/// Device hooks driven by configured shell commands and a perf-mode file.
#[derive(Debug, Clone, Default)]
pub struct CommandHooks {
    stop_transport: Vec<String>,
    enable_transport: Vec<String>,
    perf_mode_path: Option<PathBuf>,
}

impl CommandHooks {
    #[must_use]
    pub fn from_config(config: &SideloadConfig) -> Self {
        Self {
            stop_transport: config.stop_transport_command.clone(),
            enable_transport: config.enable_transport_command.clone(),
            perf_mode_path: config.perf_mode_path.clone(),
        }
    }
}

impl DeviceHooks for CommandHooks {
    fn stop_transport_daemon(&mut self) -> io::Result<()> {
        run_command(&self.stop_transport)
    }

    fn enable_transport(&mut self) -> io::Result<()> {
        run_command(&self.enable_transport)
    }

    fn set_perf_mode(&mut self, enabled: bool) -> io::Result<()> {
        match &self.perf_mode_path {
            Some(path) => std::fs::write(path, if enabled { "1" } else { "0" }),
            None => Ok(()),
        }
    }
}

/// Installs a package by running an external program with its path.
///
/// Exit status zero maps to [`ResultCode::Success`]; anything else, including
/// failure to launch, to [`ResultCode::Error`]. Each attempt is appended to the
/// install log.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    argv: Vec<String>,
}

impl CommandInstaller {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn record(log_path: &Path, package: &Path, outcome: &str) {
        let line = format!("{}\t{outcome}\n", package.display());
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .and_then(|mut log| log.write_all(line.as_bytes()));
        if let Err(err) = written {
            warn!(log = %log_path.display(), error = %err, "could not append install record");
        }
    }
}

impl PackageInstaller for CommandInstaller {
    fn install_package(
        &self,
        package: &Path,
        wipe_cache: &mut bool,
        log_path: &Path,
        interactive: bool,
    ) -> ResultCode {
        let Some((program, args)) = self.argv.split_first() else {
            warn!("no installer command configured");
            Self::record(log_path, package, "no installer");
            return ResultCode::Error;
        };
        info!(
            program = %program,
            package = %package.display(),
            wipe_cache = *wipe_cache,
            interactive,
            "running installer"
        );
        let mut command = Command::new(program);
        command.args(args).arg(package).stdin(Stdio::null());
        if *wipe_cache {
            command.env("SIDELOAD_WIPE_CACHE", "1");
        }
        match command.status() {
            Ok(status) if status.success() => {
                Self::record(log_path, package, "success");
                ResultCode::Success
            }
            Ok(status) => {
                warn!(program = %program, %status, "installer failed");
                Self::record(log_path, package, &format!("failed: {status}"));
                ResultCode::Error
            }
            Err(err) => {
                warn!(program = %program, error = %err, "installer could not start");
                Self::record(log_path, package, &format!("not started: {err}"));
                ResultCode::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned(), "installer".to_owned()]
    }

    #[test]
    fn installer_maps_exit_status_and_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("install.log");
        let package = dir.path().join("package.zip");
        let mut wipe = false;

        let ok = CommandInstaller::new(sh("test -n \"$1\""));
        assert_eq!(ok.install_package(&package, &mut wipe, &log, false), ResultCode::Success);

        let bad = CommandInstaller::new(sh("exit 7"));
        assert_eq!(bad.install_package(&package, &mut wipe, &log, false), ResultCode::Error);

        let missing = CommandInstaller::new(vec!["/nonexistent/installer".to_owned()]);
        assert_eq!(missing.install_package(&package, &mut wipe, &log, false), ResultCode::Error);

        let text = std::fs::read_to_string(&log).expect("log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("\tsuccess"));
        assert!(lines[1].contains("failed"));
        assert!(lines[2].contains("not started"));
    }

    #[test]
    fn installer_without_command_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut wipe = false;
        let installer = CommandInstaller::new(Vec::new());
        assert_eq!(
            installer.install_package(
                &dir.path().join("p.zip"),
                &mut wipe,
                &dir.path().join("log"),
                true
            ),
            ResultCode::Error
        );
    }

    #[test]
    fn hooks_write_perf_mode_and_run_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let perf = dir.path().join("perf");
        let marker = dir.path().join("enabled");
        let config = SideloadConfig {
            perf_mode_path: Some(perf.clone()),
            enable_transport_command: vec!["/bin/sh".to_owned(), "-c".to_owned(), format!("touch {}", marker.display())],
            stop_transport_command: vec!["/bin/sh".to_owned(), "-c".to_owned(), "exit 1".to_owned()],
            ..SideloadConfig::default()
        };
        let mut hooks = CommandHooks::from_config(&config);
        hooks.set_perf_mode(true).expect("perf on");
        assert_eq!(std::fs::read_to_string(&perf).expect("read"), "1");
        hooks.set_perf_mode(false).expect("perf off");
        assert_eq!(std::fs::read_to_string(&perf).expect("read"), "0");

        hooks.enable_transport().expect("enable");
        assert!(marker.exists());
        assert!(hooks.stop_transport_daemon().is_err());

        // Unconfigured hooks are no-ops.
        let mut idle = CommandHooks::default();
        idle.stop_transport_daemon().expect("noop");
        idle.set_perf_mode(true).expect("noop");
    }
}
