#![forbid(unsafe_code)]
//! FUSE adapter for the sideload filesystem.
//!
//! Kernel requests arrive via the `fuser` crate, are decoded into
//! [`protocol::Request`], answered by a [`SideloadServer`], and errors are
//! mapped through [`SideloadError::to_errno()`]. The mount exposes a read-only
//! root directory with the package file and the exit sentinel.

pub mod protocol;

pub use protocol::{NodeAttr, NodeKind, Opcode, Reply, Request, SideloadServer, PACKAGE_FH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr,
};
use serde::Serialize;
use sfs_block::{BlockFetcher, BlockProvider};
use sfs_error::SideloadError;
use sfs_types::{FileExtent, InodeNumber, DEFAULT_MOUNTPOINT, EXIT_FILE_NAME, PACKAGE_FILE_NAME};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Attribute and entry TTL. The package never changes during a session.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// `FOPEN_DIRECT_IO` from the kernel ABI: bypass the page cache.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server setup failed: {0}")]
    Setup(#[from] SideloadError),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured context for one failed request.
pub struct FuseErrorContext<'a> {
    pub error: &'a SideloadError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // Lookups of absent names are routine.
        if errno == libc::ENOENT || errno == libc::ENOSYS {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op declined"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::RegularFile => FileType::RegularFile,
    }
}

fn to_file_attr(attr: &NodeAttr, mtime: SystemTime, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.sectors(),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            allow_other: true,
            auto_unmount: false,
        }
    }
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes so counters never share a cache line.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    pub integrity_failures: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            integrity_failures: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self, error: &SideloadError) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
        if error.is_integrity() {
            self.integrity_failures.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_bytes_read(&self, n: u64) {
        self.bytes_read.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("AtomicMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("bytes_read", &s.bytes_read)
            .field("integrity_failures", &s.integrity_failures)
            .finish()
    }
}

/// Point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub integrity_failures: u64,
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// Bridges `fuser` callbacks to a [`SideloadServer`].
///
/// The server's termination flag doubles as the mount's shutdown flag. The
/// block provider is closed when the session ends.
pub struct SideloadFuse<P: BlockProvider> {
    server: SideloadServer<P>,
    metrics: Arc<AtomicMetrics>,
    shutdown: Arc<AtomicBool>,
    mounted_at: SystemTime,
    uid: u32,
    gid: u32,
}

impl<P: BlockProvider> std::fmt::Debug for SideloadFuse<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideloadFuse")
            .field("server", &self.server)
            .field("metrics", &self.metrics)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: BlockProvider> SideloadFuse<P> {
    #[must_use]
    pub fn new(server: SideloadServer<P>) -> Self {
        Self {
            shutdown: server.termination_flag(),
            server,
            metrics: Arc::new(AtomicMetrics::new()),
            mounted_at: SystemTime::now(),
            uid: 0,
            gid: 0,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<AtomicMetrics> {
        &self.metrics
    }

    /// Flag raised when the exit sentinel is looked up.
    #[must_use]
    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    /// Converts node attributes without borrowing `self`, so replies that
    /// still borrow the server can be turned into `FileAttr`s.
    fn attr_builder(&self) -> impl Fn(&NodeAttr) -> FileAttr {
        let (mtime, uid, gid) = (self.mounted_at, self.uid, self.gid);
        move |attr| to_file_attr(attr, mtime, uid, gid)
    }

    /// Run one request through the server and update metrics.
    fn dispatch(&mut self, request: Request<'_>) -> Reply<'_> {
        let reply = self.server.handle(request);
        match &reply {
            Reply::Error(err) => self.metrics.record_err(err),
            Reply::Data(bytes) => {
                self.metrics.record_ok();
                self.metrics
                    .record_bytes_read(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
            }
            _ => self.metrics.record_ok(),
        }
        reply
    }

    fn unsupported(&mut self, opcode: u32, ino: u64) -> c_int {
        match self.dispatch(Request::Unsupported { opcode }) {
            Reply::Error(err) => FuseErrorContext {
                error: &err,
                operation: "unsupported",
                ino,
                offset: None,
            }
            .log_and_errno(),
            _ => libc::ENOSYS,
        }
    }

    fn close_provider(&mut self) {
        if let Err(err) = self.server.close() {
            warn!(error = %err, "closing block provider failed");
        }
    }
}

/// Map an unexpected reply variant to an errno.
fn mismatched(op: &'static str) -> c_int {
    warn!(op, "server produced a reply of the wrong kind");
    libc::EIO
}

impl<P: BlockProvider> Filesystem for SideloadFuse<P> {
    fn init(&mut self, req: &fuser::Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        self.uid = req.uid();
        self.gid = req.gid();
        if let Reply::Init {
            max_write,
            max_readahead,
        } = self.dispatch(Request::Init)
        {
            if let Err(nearest) = config.set_max_readahead(max_readahead) {
                debug!(requested = max_readahead, nearest, "kernel clamped max_readahead");
            }
            if let Err(nearest) = config.set_max_write(max_write) {
                debug!(requested = max_write, nearest, "kernel clamped max_write");
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(metrics = ?self.metrics, "FUSE session destroyed");
        self.close_provider();
    }

    fn lookup(&mut self, _req: &fuser::Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let to_attr = self.attr_builder();
        let request = Request::Lookup {
            parent: InodeNumber(parent),
            name,
        };
        match self.dispatch(request) {
            Reply::Entry(attr) => reply.entry(&ATTR_TTL, &to_attr(&attr), 0),
            Reply::Error(err) => reply.error(
                FuseErrorContext {
                    error: &err,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
            _ => reply.error(mismatched("lookup")),
        }
    }

    fn getattr(&mut self, _req: &fuser::Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let to_attr = self.attr_builder();
        match self.dispatch(Request::Getattr {
            ino: InodeNumber(ino),
        }) {
            Reply::Attr(attr) => reply.attr(&ATTR_TTL, &to_attr(&attr)),
            Reply::Error(err) => reply.error(
                FuseErrorContext {
                    error: &err,
                    operation: "getattr",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
            _ => reply.error(mismatched("getattr")),
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.dispatch(Request::Open {
            ino: InodeNumber(ino),
        }) {
            Reply::Opened { fh, direct_io } => {
                reply.opened(fh, if direct_io { FOPEN_DIRECT_IO } else { 0 });
            }
            Reply::Error(err) => reply.error(
                FuseErrorContext {
                    error: &err,
                    operation: "open",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
            _ => reply.error(mismatched("open")),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(byte_offset) = u64::try_from(offset) else {
            warn!(ino, offset, "negative read offset");
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatch(Request::Read {
            ino: InodeNumber(ino),
            offset: byte_offset,
            size,
        }) {
            Reply::Data(bytes) => reply.data(bytes),
            Reply::Error(err) => reply.error(
                FuseErrorContext {
                    error: &err,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
            _ => reply.error(mismatched("read")),
        }
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.dispatch(Request::Flush {
            ino: InodeNumber(ino),
        }) {
            Reply::Empty => reply.ok(),
            _ => reply.error(mismatched("flush")),
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.dispatch(Request::Release {
            ino: InodeNumber(ino),
        }) {
            Reply::Empty => reply.ok(),
            _ => reply.error(mismatched("release")),
        }
    }

    // ── Unsupported operations ──────────────────────────────────────────────

    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.error(self.unsupported(27, ino));
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        reply: ReplyDirectory,
    ) {
        reply.error(self.unsupported(28, ino));
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: ReplyStatfs) {
        reply.error(self.unsupported(17, ino));
    }

    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(self.unsupported(22, ino));
    }

    fn listxattr(&mut self, _req: &fuser::Request<'_>, ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(self.unsupported(23, ino));
    }

    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.error(self.unsupported(34, ino));
    }
}

impl<P: BlockProvider> Drop for SideloadFuse<P> {
    fn drop(&mut self) {
        self.close_provider();
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Build the `fuser` option list for a package with the given block size.
///
/// `max_read` caps every READ at one block, so a request never spans more
/// than two blocks.
fn build_mount_options(options: &MountOptions, block_size: u32) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("sideload".to_owned()),
        MountOption::Subtype("sideload".to_owned()),
        MountOption::NoAtime,
        MountOption::CUSTOM(format!("max_read={block_size}")),
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Lazily detach whatever is mounted at `mountpoint`.
///
/// Best effort: returns whether any unmount command succeeded. Used before
/// mounting to clear a stale session and at teardown so outstanding
/// requests cannot pin the mount.
pub fn force_unmount(mountpoint: &Path) -> bool {
    let attempts: [(&str, &[&str]); 2] = [("fusermount", &["-u", "-z"]), ("umount", &["-l"])];
    for (program, args) in attempts {
        match Command::new(program)
            .args(args)
            .arg(mountpoint)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {
                debug!(program, mountpoint = %mountpoint.display(), "detached mount");
                return true;
            }
            Ok(status) => trace!(program, ?status, "unmount command declined"),
            Err(err) => trace!(program, error = %err, "unmount command unavailable"),
        }
    }
    false
}

// ── Mount lifecycle ─────────────────────────────────────────────────────────

/// Configuration for a managed sideload mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub options: MountOptions,
    pub mountpoint: PathBuf,
    pub package_name: String,
    pub exit_name: String,
    /// Upper bound on cached blocks; see `sfs_block::cache_budget`.
    pub cache_budget: usize,
    /// How often [`MountHandle::wait`] checks for termination.
    pub tick: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            options: MountOptions::default(),
            mountpoint: PathBuf::from(DEFAULT_MOUNTPOINT),
            package_name: PACKAGE_FILE_NAME.to_owned(),
            exit_name: EXIT_FILE_NAME.to_owned(),
            cache_budget: 0,
            tick: Duration::from_millis(100),
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn package_path(&self) -> PathBuf {
        self.mountpoint.join(&self.package_name)
    }

    #[must_use]
    pub fn exit_path(&self) -> PathBuf {
        self.mountpoint.join(&self.exit_name)
    }
}

/// Handle for a live mount.
///
/// The shutdown flag is raised by the adapter when the exit sentinel is
/// looked up, or by any owner (e.g. a signal handler). [`wait`] polls it and
/// unmounts once set. Dropping the handle also unmounts.
///
/// [`wait`]: MountHandle::wait
pub struct MountHandle {
    session: Option<fuser::BackgroundSession>,
    mountpoint: PathBuf,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<AtomicMetrics>,
    tick: Duration,
}

impl MountHandle {
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    #[must_use]
    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Block until the shutdown flag is set, then unmount.
    ///
    /// Returns the final metrics snapshot.
    #[must_use]
    pub fn wait(mut self) -> MetricsSnapshot {
        info!(mountpoint = %self.mountpoint.display(), "serving package");
        while !self.shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(self.tick);
        }
        info!(mountpoint = %self.mountpoint.display(), "termination requested");
        self.do_unmount()
    }

    /// Unmount now, regardless of the shutdown flag.
    #[must_use]
    pub fn unmount(mut self) -> MetricsSnapshot {
        self.do_unmount()
    }

    fn do_unmount(&mut self) -> MetricsSnapshot {
        let snap = self.metrics.snapshot();
        if let Some(session) = self.session.take() {
            info!(
                mountpoint = %self.mountpoint.display(),
                requests_total = snap.requests_total,
                requests_err = snap.requests_err,
                bytes_read = snap.bytes_read,
                integrity_failures = snap.integrity_failures,
                "unmounting sideload filesystem"
            );
            force_unmount(&self.mountpoint);
            // Joins the session thread; the adapter closes the provider.
            drop(session);
            info!(mountpoint = %self.mountpoint.display(), "unmount complete");
        }
        snap
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.do_unmount();
        }
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("active", &self.session.is_some())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(format!(
            "mountpoint is not a directory: {}",
            mountpoint.display()
        )));
    }
    Ok(())
}

/// Mount `provider` as the package file and return a handle to the live
/// session.
pub fn mount_managed<P>(
    provider: P,
    extent: FileExtent,
    config: &MountConfig,
) -> Result<MountHandle, FuseError>
where
    P: BlockProvider + 'static,
{
    let mountpoint = config.mountpoint.as_path();
    check_mountpoint(mountpoint)?;
    if force_unmount(mountpoint) {
        info!(mountpoint = %mountpoint.display(), "cleared stale mount");
    }

    let fetcher = BlockFetcher::new(provider, extent, config.cache_budget)?;
    let server =
        SideloadServer::new(fetcher).with_names(&config.package_name, &config.exit_name);
    let fs = SideloadFuse::new(server);
    let shutdown = Arc::clone(fs.shutdown_flag());
    let metrics = Arc::clone(fs.metrics());

    info!(
        mountpoint = %mountpoint.display(),
        file_size = extent.file_size(),
        block_size = extent.block_size(),
        cache_budget = config.cache_budget,
        "mounting sideload filesystem"
    );
    let fuse_opts = build_mount_options(&config.options, extent.block_size());
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    info!(mountpoint = %mountpoint.display(), "FUSE mount active");

    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_owned(),
        shutdown,
        metrics,
        tick: config.tick,
    })
}

/// Serve `provider` until the exit sentinel is looked up, then unmount.
pub fn serve<P>(
    provider: P,
    extent: FileExtent,
    config: &MountConfig,
) -> Result<MetricsSnapshot, FuseError>
where
    P: BlockProvider + 'static,
{
    Ok(mount_managed(provider, extent, config)?.wait())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_block::StreamProvider;
    use sfs_types::{EXIT_INODE, PACKAGE_INODE, ROOT_INODE};
    use std::io::Cursor;

    fn adapter(file_size: usize) -> SideloadFuse<StreamProvider<Cursor<Vec<u8>>>> {
        let data: Vec<u8> = (0..file_size).map(|i| (i % 199) as u8).collect();
        let extent = FileExtent::new(file_size as u64, 4096).expect("extent");
        let fetcher =
            BlockFetcher::new(StreamProvider::new(Cursor::new(data), 4096), extent, 2).expect("fetcher");
        SideloadFuse::new(SideloadServer::new(fetcher))
    }

    fn handle_without_session(mountpoint: &str) -> MountHandle {
        MountHandle {
            session: None,
            mountpoint: PathBuf::from(mountpoint),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(AtomicMetrics::new()),
            tick: Duration::from_millis(10),
        }
    }

    #[test]
    fn file_attr_conversion() {
        let attr = NodeAttr {
            ino: PACKAGE_INODE,
            size: 10_000,
            kind: NodeKind::RegularFile,
            perm: 0o444,
            nlink: 1,
            blksize: 4096,
        };
        let now = SystemTime::now();
        let fa = to_file_attr(&attr, now, 1000, 1000);
        assert_eq!(fa.ino, 2);
        assert_eq!(fa.size, 10_000);
        assert_eq!(fa.blocks, 20);
        assert_eq!(fa.kind, FileType::RegularFile);
        assert_eq!(fa.perm, 0o444);
        assert_eq!(fa.uid, 1000);
        assert_eq!(fa.blksize, 4096);
        assert_eq!(fa.mtime, now);
    }

    #[test]
    fn mount_options_include_max_read_and_read_only() {
        let opts = build_mount_options(&MountOptions::default(), 65_536);
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::CUSTOM("max_read=65536".to_owned())));
        assert!(!opts.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn mount_options_respect_flags() {
        let opts = build_mount_options(
            &MountOptions {
                read_only: false,
                allow_other: false,
                auto_unmount: true,
            },
            4096,
        );
        assert!(!opts.contains(&MountOption::RO));
        assert!(!opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn mount_config_paths() {
        let config = MountConfig::default();
        assert_eq!(config.package_path(), PathBuf::from("/sideload/package.zip"));
        assert_eq!(config.exit_path(), PathBuf::from("/sideload/exit"));
        assert_eq!(config.tick, Duration::from_millis(100));
    }

    #[test]
    fn mount_rejects_empty_and_missing_mountpoint() {
        let provider = StreamProvider::new(Cursor::new(vec![0_u8; 16]), 4096);
        let extent = FileExtent::new(16, 4096).expect("extent");
        let config = MountConfig {
            mountpoint: PathBuf::new(),
            ..MountConfig::default()
        };
        let err = mount_managed(provider, extent, &config).unwrap_err();
        assert!(err.to_string().contains("cannot be empty"), "{err}");

        let dir = tempfile::tempdir().expect("tempdir");
        let provider = StreamProvider::new(Cursor::new(vec![0_u8; 16]), 4096);
        let config = MountConfig {
            mountpoint: dir.path().join("absent"),
            ..MountConfig::default()
        };
        let err = mount_managed(provider, extent, &config).unwrap_err();
        assert!(err.to_string().contains("not a directory"), "{err}");
    }

    #[test]
    fn sentinel_lookup_raises_shutdown_flag() {
        let mut fs = adapter(10_000);
        let flag = Arc::clone(fs.shutdown_flag());
        let reply = fs.dispatch(Request::Lookup {
            parent: ROOT_INODE,
            name: OsStr::new(PACKAGE_FILE_NAME),
        });
        assert!(matches!(reply, Reply::Entry(_)));
        assert!(!flag.load(Ordering::Relaxed));

        let reply = fs.dispatch(Request::Lookup {
            parent: ROOT_INODE,
            name: OsStr::new(EXIT_FILE_NAME),
        });
        assert!(matches!(reply, Reply::Entry(attr) if attr.ino == EXIT_INODE));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn dispatch_updates_metrics() {
        let mut fs = adapter(10_000);
        let reply = fs.dispatch(Request::Read {
            ino: PACKAGE_INODE,
            offset: 4090,
            size: 20,
        });
        assert!(matches!(reply, Reply::Data(bytes) if bytes.len() == 20));
        let reply = fs.dispatch(Request::Open { ino: EXIT_INODE });
        assert!(reply.is_error());
        assert_eq!(fs.unsupported(28, ROOT_INODE.0), libc::ENOSYS);

        let snap = fs.metrics().snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.requests_ok, 1);
        assert_eq!(snap.requests_err, 2);
        assert_eq!(snap.bytes_read, 20);
        assert_eq!(snap.integrity_failures, 0);
    }

    #[test]
    fn error_context_maps_errno() {
        let err = SideloadError::PermissionDenied;
        let ctx = FuseErrorContext {
            error: &err,
            operation: "open",
            ino: 3,
            offset: None,
        };
        assert_eq!(ctx.log_and_errno(), libc::EPERM);

        let err = SideloadError::Integrity { block: 4 };
        let ctx = FuseErrorContext {
            error: &err,
            operation: "read",
            ino: 2,
            offset: Some(16_384),
        };
        assert_eq!(ctx.log_and_errno(), libc::EIO);
    }

    #[test]
    fn metrics_count_integrity_failures() {
        let metrics = AtomicMetrics::new();
        metrics.record_err(&SideloadError::Integrity { block: 1 });
        metrics.record_err(&SideloadError::Closed);
        metrics.record_ok();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.integrity_failures, 1);
    }

    #[test]
    fn cache_line_padded_alignment() {
        assert_eq!(std::mem::align_of::<CacheLinePadded<AtomicU64>>(), 64);
    }

    #[test]
    fn mount_handle_wait_returns_on_shutdown() {
        let handle = handle_without_session("/mnt/wait");
        handle.metrics.record_ok();
        let trigger = Arc::clone(handle.shutdown_flag());
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            trigger.store(true, Ordering::Relaxed);
        });
        let snap = handle.wait();
        assert_eq!(snap.requests_ok, 1);
    }

    #[test]
    fn mount_handle_debug_and_drop_without_session() {
        let handle = handle_without_session("/mnt/dbg");
        let dbg = format!("{handle:?}");
        assert!(dbg.contains("/mnt/dbg"), "{dbg}");
        assert!(dbg.contains("active: false"), "{dbg}");
        drop(handle);
    }
}
