#![forbid(unsafe_code)]
//! Controller lifecycle against real `sh` companions in a temp mountpoint.

use parking_lot::Mutex;
use sfs_session::{
    DeviceHooks, PackageInstaller, RecoveryUi, ResultCode, SideloadConfig, SideloadController,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingUi(Mutex<Vec<String>>);

impl RecordingUi {
    fn contains(&self, needle: &str) -> bool {
        self.0.lock().iter().any(|line| line.contains(needle))
    }
}

impl RecoveryUi for RecordingUi {
    fn print(&self, message: &str) {
        self.0.lock().push(message.to_owned());
    }
}

#[derive(Clone, Default)]
struct RecordingHooks(Arc<Mutex<Vec<String>>>);

impl DeviceHooks for RecordingHooks {
    fn stop_transport_daemon(&mut self) -> io::Result<()> {
        self.0.lock().push("stop-transport".to_owned());
        Ok(())
    }

    fn enable_transport(&mut self) -> io::Result<()> {
        self.0.lock().push("enable-transport".to_owned());
        Ok(())
    }

    fn set_perf_mode(&mut self, enabled: bool) -> io::Result<()> {
        self.0.lock().push(format!("perf={enabled}"));
        Ok(())
    }
}

/// Installer that records its calls and touches the exit sentinel, the way
/// a finished install lets the companion unmount.
struct ScriptedInstaller {
    calls: Mutex<Vec<PathBuf>>,
    exit_path: PathBuf,
    result: ResultCode,
}

impl PackageInstaller for ScriptedInstaller {
    fn install_package(
        &self,
        package: &Path,
        wipe_cache: &mut bool,
        _log_path: &Path,
        interactive: bool,
    ) -> ResultCode {
        assert!(!interactive);
        self.calls.lock().push(package.to_owned());
        *wipe_cache = true;
        std::fs::write(&self.exit_path, b"").expect("touch exit");
        self.result
    }
}

fn config(dir: &Path, script: &str, max_polls: u32) -> SideloadConfig {
    SideloadConfig {
        mountpoint: dir.to_owned(),
        poll_interval_ms: 20,
        max_polls,
        // Long enough that only an explicit kill ends a stuck companion in time.
        reap_grace_ms: 30_000,
        companion_program: Some(PathBuf::from("/bin/sh")),
        companion_args: vec![
            "-c".to_owned(),
            script.to_owned(),
            dir.display().to_string(),
        ],
        ..SideloadConfig::default()
    }
}

fn installer(dir: &Path, result: ResultCode) -> Arc<ScriptedInstaller> {
    Arc::new(ScriptedInstaller {
        calls: Mutex::new(Vec::new()),
        exit_path: dir.join("exit"),
        result,
    })
}

/// Companion that records its pid and never publishes anything.
const PID_COMPANION: &str = r#"echo $$ > "$0/companion.pid"; exec sleep 30"#;

/// Companion that publishes the package, then waits for the sentinel.
const PUBLISHING_COMPANION: &str =
    r#"touch "$0/package.zip"; while [ ! -e "$0/exit" ]; do sleep 0.02; done"#;

#[test]
fn package_appearing_is_installed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inst = installer(dir.path(), ResultCode::Success);
    let hooks = RecordingHooks::default();
    let ui = Arc::new(RecordingUi::default());
    let mut controller = SideloadController::new(
        config(dir.path(), PUBLISHING_COMPANION, 250),
        inst.clone(),
        Box::new(hooks.clone()),
    );

    let mut wipe_cache = false;
    let mut session = controller
        .start(ui.clone(), &mut wipe_cache, dir.path().join("install.log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::Success);
    assert!(session.is_finished());
    drop(session);
    assert!(wipe_cache);

    assert_eq!(*inst.calls.lock(), vec![dir.path().join("package.zip")]);
    assert!(ui.contains("Now send the package"));
    assert!(!ui.contains("companion status"));
    assert_eq!(
        *hooks.0.lock(),
        vec!["stop-transport".to_owned(), "enable-transport".to_owned()]
    );
}

#[test]
fn installer_failure_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inst = installer(dir.path(), ResultCode::Error);
    let mut controller = SideloadController::new(
        config(dir.path(), PUBLISHING_COMPANION, 250),
        inst.clone(),
        Box::new(RecordingHooks::default()),
    );
    let mut wipe_cache = false;
    let mut session = controller
        .start(Arc::new(RecordingUi::default()), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::Error);
    assert_eq!(inst.calls.lock().len(), 1);
}

#[test]
fn timeout_yields_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inst = installer(dir.path(), ResultCode::Success);
    let ui = Arc::new(RecordingUi::default());
    let mut controller = SideloadController::new(
        config(dir.path(), PID_COMPANION, 25),
        inst.clone(),
        Box::new(RecordingHooks::default()),
    );

    let started = Instant::now();
    let mut wipe_cache = false;
    let mut session = controller
        .start(ui.clone(), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::None);
    // Killed on timeout, well inside the reap grace period.
    assert!(started.elapsed() < Duration::from_secs(10));
    let pid = std::fs::read_to_string(dir.path().join("companion.pid")).expect("pid file");
    assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    assert!(ui.contains("Timed out waiting for package"));
    assert!(inst.calls.lock().is_empty());
}

#[test]
fn stop_before_package_returns_none_within_an_interval() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hooks = RecordingHooks::default();
    let mut cfg = config(dir.path(), "sleep 30", 10_000);
    cfg.poll_interval_ms = 500;
    let mut controller = SideloadController::new(
        cfg,
        installer(dir.path(), ResultCode::Success),
        Box::new(hooks.clone()),
    );

    // No installer runs, so the caller's flag comes back as it went in.
    let mut wipe_cache = true;
    let mut session = controller
        .start(Arc::new(RecordingUi::default()), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    std::thread::sleep(Duration::from_millis(50));
    let stopped_at = Instant::now();
    assert_eq!(session.stop(), ResultCode::None);
    assert!(stopped_at.elapsed() < Duration::from_secs(3));

    // Repeated calls return the recorded result without rejoining.
    assert_eq!(session.stop(), ResultCode::None);
    assert_eq!(session.wait(), ResultCode::None);
    drop(session);
    assert!(wipe_cache);

    let events = hooks.0.lock().clone();
    assert_eq!(
        events,
        vec![
            "stop-transport".to_owned(),
            "enable-transport".to_owned(),
            "perf=true".to_owned(),
            "perf=false".to_owned(),
        ]
    );
}

#[test]
fn wait_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut controller = SideloadController::new(
        config(dir.path(), "sleep 30", 2),
        installer(dir.path(), ResultCode::Success),
        Box::new(RecordingHooks::default()),
    );
    let mut wipe_cache = false;
    let mut session = controller
        .start(Arc::new(RecordingUi::default()), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::None);
    assert_eq!(session.wait(), ResultCode::None);
}

#[test]
fn companion_death_is_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ui = Arc::new(RecordingUi::default());
    let mut controller = SideloadController::new(
        config(dir.path(), "exit 1", 250),
        installer(dir.path(), ResultCode::Success),
        Box::new(RecordingHooks::default()),
    );
    let mut wipe_cache = false;
    let mut session = controller
        .start(ui.clone(), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::Error);
    assert!(ui.contains("(companion status 1)"));
}

#[test]
fn host_too_old_is_explained() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ui = Arc::new(RecordingUi::default());
    let mut controller = SideloadController::new(
        config(dir.path(), "exit 3", 250),
        installer(dir.path(), ResultCode::Success),
        Box::new(RecordingHooks::default()),
    );
    let mut wipe_cache = false;
    let mut session = controller
        .start(ui.clone(), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::Error);
    assert!(ui.contains("newer host tool"));
    assert!(!ui.contains("companion status"));
}

#[test]
fn unlaunchable_companion_is_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ui = Arc::new(RecordingUi::default());
    let mut cfg = config(dir.path(), "true", 5);
    cfg.companion_program = Some(dir.path().join("missing-binary"));
    let mut controller = SideloadController::new(
        cfg,
        installer(dir.path(), ResultCode::Success),
        Box::new(RecordingHooks::default()),
    );
    let mut wipe_cache = false;
    let mut session = controller
        .start(ui.clone(), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    assert_eq!(session.wait(), ResultCode::Error);
    assert!(ui.contains("Could not start sideload companion"));
}

#[test]
fn dropping_a_running_session_stops_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(dir.path(), "sleep 30", 10_000);
    cfg.poll_interval_ms = 200;
    let mut controller = SideloadController::new(
        cfg,
        installer(dir.path(), ResultCode::Success),
        Box::new(RecordingHooks::default()),
    );
    let started = Instant::now();
    let mut wipe_cache = false;
    let session = controller
        .start(Arc::new(RecordingUi::default()), &mut wipe_cache, dir.path().join("log"))
        .expect("start");
    drop(session);
    assert!(started.elapsed() < Duration::from_secs(3));
}
