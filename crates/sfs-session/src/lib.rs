#![forbid(unsafe_code)]
//! Sideload session controller.
//!
//! A session launches the companion daemon (which mounts the package),
//! waits for the package file to appear, hands it to the installer and
//! finally tears the companion down. [`SideloadController::start`] returns a
//! [`SideloadSession`] whose [`wait`](SideloadSession::wait) and
//! [`stop`](SideloadSession::stop) both yield the recorded [`ResultCode`].
//!
//! Session state lives behind one mutex; the condvar only shortens the
//! inter-poll sleep when a stop is requested.

pub mod config;
pub mod hooks;

pub use config::{SideloadConfig, DEFAULT_LISTEN_ADDR};
pub use hooks::{CommandHooks, CommandInstaller};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sfs_types::EXIT_HOST_TOO_OLD;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Outcome of a sideload session as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    Error,
    /// No package was installed: timed out or canceled.
    None,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("config {}: {detail}", .path.display())]
    Config { path: PathBuf, detail: String },
    #[error("cannot start session thread: {0}")]
    Spawn(#[source] io::Error),
}

// ── Seams ───────────────────────────────────────────────────────────────────

/// Where user-facing progress messages go.
pub trait RecoveryUi: Send + Sync {
    fn print(&self, message: &str);
}

pub trait PackageInstaller: Send + Sync {
    /// Install the package at `package`. May set `wipe_cache` to request a
    /// cache wipe after installation.
    fn install_package(
        &self,
        package: &Path,
        wipe_cache: &mut bool,
        log_path: &Path,
        interactive: bool,
    ) -> ResultCode;
}

/// Platform actions around a session.
pub trait DeviceHooks: Send {
    /// Stop any transport daemon that would compete for the host connection.
    fn stop_transport_daemon(&mut self) -> io::Result<()>;
    fn enable_transport(&mut self) -> io::Result<()>;
    /// I/O priority hint raised while the session is being torn down.
    fn set_perf_mode(&mut self, enabled: bool) -> io::Result<()>;
}

// ── Shared state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionState {
    cancel: bool,
    finished: bool,
    result: ResultCode,
    wipe_cache: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    wake: Condvar,
}

/// Why the poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Installed,
    TimedOut,
    Canceled,
    CompanionDied,
    Failed,
}

// ── Controller ──────────────────────────────────────────────────────────────

pub struct SideloadController {
    config: SideloadConfig,
    installer: Arc<dyn PackageInstaller>,
    hooks: Box<dyn DeviceHooks>,
}

impl std::fmt::Debug for SideloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideloadController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SideloadController {
    #[must_use]
    pub fn new(
        config: SideloadConfig,
        installer: Arc<dyn PackageInstaller>,
        hooks: Box<dyn DeviceHooks>,
    ) -> Self {
        Self {
            config,
            installer,
            hooks,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SideloadConfig {
        &self.config
    }

    /// Start a session. The session thread owns the companion process until
    /// [`SideloadSession::wait`] or [`SideloadSession::stop`] reaps it.
    ///
    /// `wipe_cache` seeds the installer's flag and receives its final value
    /// once the session has been joined.
    pub fn start<'c>(
        &'c mut self,
        ui: Arc<dyn RecoveryUi>,
        wipe_cache: &'c mut bool,
        install_record_path: impl Into<PathBuf>,
    ) -> Result<SideloadSession<'c>, SessionError> {
        if let Err(err) = self.hooks.stop_transport_daemon() {
            warn!(error = %err, "could not stop transport daemon");
        }
        if let Err(err) = self.hooks.enable_transport() {
            warn!(error = %err, "could not enable transport");
        }
        ui.print(&format!(
            "\n\nNow send the package you want to apply\nto the device with \"sideload host-send <file> {}\"...\n",
            self.config.listen_addr
        ));

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                cancel: false,
                finished: false,
                result: ResultCode::None,
                wipe_cache: *wipe_cache,
            }),
            wake: Condvar::new(),
        });
        let worker = Worker {
            config: self.config.clone(),
            installer: Arc::clone(&self.installer),
            ui,
            install_record: install_record_path.into(),
            shared: Arc::clone(&shared),
        };
        let handle = std::thread::Builder::new()
            .name("sideload-session".to_owned())
            .spawn(move || worker.run())
            .map_err(SessionError::Spawn)?;
        info!(mountpoint = %self.config.mountpoint.display(), "sideload session started");

        Ok(SideloadSession {
            shared,
            handle: Some(handle),
            exit_path: self.config.exit_path(),
            hooks: self.hooks.as_mut(),
            wipe_cache,
        })
    }
}

// ── Session handle ──────────────────────────────────────────────────────────

/// A running or finished session.
///
/// `wait` and `stop` are idempotent: the session thread is joined at most
/// once and later calls return the recorded result. Dropping a running
/// session stops it.
pub struct SideloadSession<'c> {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    exit_path: PathBuf,
    hooks: &'c mut dyn DeviceHooks,
    wipe_cache: &'c mut bool,
}

impl std::fmt::Debug for SideloadSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideloadSession")
            .field("state", &*self.shared.state.lock())
            .field("joined", &self.handle.is_none())
            .finish_non_exhaustive()
    }
}

impl SideloadSession<'_> {
    /// Whether the session thread has recorded its result.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().finished
    }

    /// Block until the session finishes and return its result. The caller's
    /// wipe-cache flag is updated on the first join.
    pub fn wait(&mut self) -> ResultCode {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("session thread panicked");
                let mut state = self.shared.state.lock();
                state.result = ResultCode::Error;
                state.finished = true;
            }
            *self.wipe_cache = self.shared.state.lock().wipe_cache;
        }
        self.shared.state.lock().result
    }

    /// Cancel the session, wait for it and return its result.
    pub fn stop(&mut self) -> ResultCode {
        if self.handle.is_none() {
            return self.wait();
        }
        // Looking up the sentinel makes the companion unmount and exit.
        touch_sentinel(&self.exit_path);
        if let Err(err) = self.hooks.set_perf_mode(true) {
            debug!(error = %err, "perf mode hint not applied");
        }
        {
            let mut state = self.shared.state.lock();
            state.cancel = true;
            self.shared.wake.notify_all();
        }
        let result = self.wait();
        if let Err(err) = self.hooks.set_perf_mode(false) {
            debug!(error = %err, "perf mode hint not cleared");
        }
        info!(?result, "sideload session stopped");
        result
    }
}

impl Drop for SideloadSession<'_> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn touch_sentinel(path: &Path) {
    match std::fs::metadata(path) {
        Ok(_) => debug!(path = %path.display(), "exit sentinel present"),
        Err(err) => debug!(path = %path.display(), error = %err, "exit sentinel looked up"),
    }
}

// ── Session thread ──────────────────────────────────────────────────────────

struct Worker {
    config: SideloadConfig,
    installer: Arc<dyn PackageInstaller>,
    ui: Arc<dyn RecoveryUi>,
    install_record: PathBuf,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        let result = self.session();
        let mut state = self.shared.state.lock();
        state.result = result;
        state.finished = true;
        info!(?result, "sideload session finished");
    }

    fn session(&self) -> ResultCode {
        let mut companion = match self.config.companion_command().and_then(|mut c| c.spawn()) {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to launch companion");
                self.ui.print(&format!("\nCould not start sideload companion: {err}\n"));
                return ResultCode::Error;
            }
        };
        debug!(pid = companion.id(), "companion launched");

        let (exit, result, mut status) = self.poll(&mut companion);
        match exit {
            LoopExit::TimedOut => {
                self.ui.print("\nTimed out waiting for package.\n\n");
                kill(&mut companion);
            }
            LoopExit::Canceled => {
                debug!("session canceled");
                kill(&mut companion);
            }
            LoopExit::Failed => kill(&mut companion),
            LoopExit::Installed | LoopExit::CompanionDied => {}
        }

        if status.is_none() {
            touch_sentinel(&self.config.exit_path());
            status = self.reap(&mut companion);
        }
        if let Some(status) = status {
            self.report_exit(status);
        }
        result
    }

    /// Poll for the package. Returns how the loop ended, the result so far,
    /// and the companion's exit status if it has already been reaped.
    fn poll(&self, companion: &mut Child) -> (LoopExit, ResultCode, Option<ExitStatus>) {
        let package = self.config.package_path();
        let interval = self.config.poll_interval();

        for attempt in 0..self.config.max_polls {
            match companion.try_wait() {
                Ok(Some(status)) => {
                    warn!(%status, attempt, "companion exited before the package appeared");
                    return (LoopExit::CompanionDied, ResultCode::Error, Some(status));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "cannot query companion");
                    return (LoopExit::Failed, ResultCode::Error, None);
                }
            }

            match std::fs::metadata(&package) {
                Ok(_) => {
                    info!(package = %package.display(), attempt, "package available");
                    return (LoopExit::Installed, self.install(&package), None);
                }
                // Not there yet, or the mount is still coming up.
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::NotConnected
                    ) => {}
                Err(err) => {
                    warn!(package = %package.display(), error = %err, "cannot stat package");
                    self.ui.print(&format!("\nError reading package: {err}\n"));
                    return (LoopExit::Failed, ResultCode::Error, None);
                }
            }

            let mut state = self.shared.state.lock();
            if !state.cancel {
                let _ = self.shared.wake.wait_for(&mut state, interval);
            }
            if state.cancel {
                return (LoopExit::Canceled, ResultCode::None, None);
            }
        }
        (LoopExit::TimedOut, ResultCode::None, None)
    }

    fn install(&self, package: &Path) -> ResultCode {
        let mut wipe_cache = self.shared.state.lock().wipe_cache;
        let result =
            self.installer
                .install_package(package, &mut wipe_cache, &self.install_record, false);
        self.shared.state.lock().wipe_cache = wipe_cache;
        info!(?result, wipe_cache, "installer finished");
        result
    }

    /// Give the companion the grace period to exit, then kill it.
    fn reap(&self, companion: &mut Child) -> Option<ExitStatus> {
        let deadline = Instant::now() + self.config.reap_grace();
        loop {
            match companion.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => {
                    warn!(pid = companion.id(), "companion did not exit, killing");
                    kill(companion);
                    return match companion.wait() {
                        Ok(status) => Some(status),
                        Err(err) => {
                            warn!(error = %err, "cannot wait for companion");
                            None
                        }
                    };
                }
                Err(err) => {
                    warn!(error = %err, "cannot reap companion");
                    return None;
                }
            }
        }
    }

    fn report_exit(&self, status: ExitStatus) {
        debug!(%status, "companion reaped");
        match status.code() {
            Some(0) | None => {}
            Some(EXIT_HOST_TOO_OLD) => self
                .ui
                .print("\nYou need a newer host tool to sideload\nto this device.\n\n"),
            Some(code) => self.ui.print(&format!("\n(companion status {code})\n")),
        }
    }
}

/// Send SIGKILL; the caller reaps.
fn kill(companion: &mut Child) {
    if let Err(err) = companion.kill() {
        debug!(error = %err, "companion already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_mentions_path() {
        let err = SessionError::Config {
            path: PathBuf::from("/etc/sideload.toml"),
            detail: "bad".to_owned(),
        };
        assert_eq!(err.to_string(), "config /etc/sideload.toml: bad");
    }
}
