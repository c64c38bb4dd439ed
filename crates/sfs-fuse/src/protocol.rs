//! Sideload protocol state machine.
//!
//! Kernel requests are decoded into [`Request`] at the transport boundary and
//! handled one at a time by [`SideloadServer::handle`], which always produces
//! exactly one [`Reply`]. The server exposes a root directory holding two
//! names: the package file and the exit sentinel.

use sfs_block::{BlockFetcher, BlockProvider};
use sfs_error::{Result, SideloadError};
use sfs_types::{
    BlockIndex, FileExtent, InodeNumber, EXIT_FILE_NAME, EXIT_INODE, PACKAGE_FILE_NAME,
    PACKAGE_INODE, ROOT_INODE,
};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// File handle returned for the opened package.
pub const PACKAGE_FH: u64 = 10;

/// FUSE kernel opcodes for the requests the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Getattr = 3,
    Open = 14,
    Read = 15,
    Release = 18,
    Flush = 25,
    Init = 26,
}

impl Opcode {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Getattr => "getattr",
            Self::Open => "open",
            Self::Read => "read",
            Self::Release => "release",
            Self::Flush => "flush",
            Self::Init => "init",
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = SideloadError;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Lookup,
            3 => Self::Getattr,
            14 => Self::Open,
            15 => Self::Read,
            18 => Self::Release,
            25 => Self::Flush,
            26 => Self::Init,
            other => return Err(SideloadError::Unimplemented(other)),
        })
    }
}

/// A decoded kernel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Init,
    Lookup { parent: InodeNumber, name: &'a OsStr },
    Getattr { ino: InodeNumber },
    Open { ino: InodeNumber },
    Read { ino: InodeNumber, offset: u64, size: u32 },
    Flush { ino: InodeNumber },
    Release { ino: InodeNumber },
    /// Any opcode outside the supported set, by raw number.
    Unsupported { opcode: u32 },
}

impl Request<'_> {
    /// Operation name for logs and error context.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self.opcode() {
            Ok(op) => op.name(),
            Err(_) => "unsupported",
        }
    }

    pub fn opcode(&self) -> Result<Opcode> {
        Ok(match self {
            Self::Init => Opcode::Init,
            Self::Lookup { .. } => Opcode::Lookup,
            Self::Getattr { .. } => Opcode::Getattr,
            Self::Open { .. } => Opcode::Open,
            Self::Read { .. } => Opcode::Read,
            Self::Flush { .. } => Opcode::Flush,
            Self::Release { .. } => Opcode::Release,
            Self::Unsupported { opcode } => return Err(SideloadError::Unimplemented(*opcode)),
        })
    }

    /// Inode the request targets, for error context.
    #[must_use]
    pub fn ino(&self) -> u64 {
        match *self {
            Self::Lookup { parent, .. } => parent.0,
            Self::Getattr { ino }
            | Self::Open { ino }
            | Self::Read { ino, .. }
            | Self::Flush { ino }
            | Self::Release { ino } => ino.0,
            Self::Init | Self::Unsupported { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
}

/// Attributes of one of the three exposed nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub blksize: u32,
}

impl NodeAttr {
    /// Number of 512-byte sectors covering `size`.
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

/// The server's answer to one request.
#[derive(Debug)]
pub enum Reply<'a> {
    Init { max_write: u32, max_readahead: u32 },
    Entry(NodeAttr),
    Attr(NodeAttr),
    Opened { fh: u64, direct_io: bool },
    /// Exactly the requested number of bytes.
    Data(&'a [u8]),
    Empty,
    Error(SideloadError),
}

impl Reply<'_> {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

pub struct SideloadServer<P> {
    fetcher: BlockFetcher<P>,
    /// Holds straddling READ replies: tail of one block, head of the next.
    extra: Box<[u8]>,
    /// Raised once the exit sentinel is looked up; shared with the mount
    /// loop that waits for it.
    terminated: Arc<AtomicBool>,
    package_name: String,
    exit_name: String,
}

impl<P> std::fmt::Debug for SideloadServer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideloadServer")
            .field("fetcher", &self.fetcher)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: BlockProvider> SideloadServer<P> {
    #[must_use]
    pub fn new(fetcher: BlockFetcher<P>) -> Self {
        let extra = vec![0_u8; fetcher.extent().block_len()].into_boxed_slice();
        Self {
            fetcher,
            extra,
            terminated: Arc::new(AtomicBool::new(false)),
            package_name: PACKAGE_FILE_NAME.to_owned(),
            exit_name: EXIT_FILE_NAME.to_owned(),
        }
    }

    /// Expose the package and the sentinel under other names.
    #[must_use]
    pub fn with_names(mut self, package_name: &str, exit_name: &str) -> Self {
        package_name.clone_into(&mut self.package_name);
        exit_name.clone_into(&mut self.exit_name);
        self
    }

    #[must_use]
    pub fn extent(&self) -> FileExtent {
        self.fetcher.extent()
    }

    /// Whether the exit sentinel has been looked up.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Flag raised on termination. Owners may also raise it to stop serving.
    #[must_use]
    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }

    #[must_use]
    pub fn fetcher(&self) -> &BlockFetcher<P> {
        &self.fetcher
    }

    /// Close the block provider.
    pub fn close(&mut self) -> Result<()> {
        self.fetcher.close()
    }

    pub fn handle(&mut self, request: Request<'_>) -> Reply<'_> {
        trace!(op = request.op_name(), ino = request.ino(), "request");
        match request {
            Request::Init => {
                let block_size = self.extent().block_size();
                Reply::Init {
                    max_write: block_size,
                    max_readahead: block_size,
                }
            }
            Request::Lookup { parent, name } => match self.lookup(parent, name) {
                Ok(attr) => Reply::Entry(attr),
                Err(err) => Reply::Error(err),
            },
            Request::Getattr { ino } => match self.attr(ino) {
                Ok(attr) => Reply::Attr(attr),
                Err(err) => Reply::Error(err),
            },
            Request::Open { ino } => match ino {
                EXIT_INODE => Reply::Error(SideloadError::PermissionDenied),
                PACKAGE_INODE => Reply::Opened {
                    fh: PACKAGE_FH,
                    direct_io: true,
                },
                other => Reply::Error(SideloadError::NotFound(format!("inode {}", other.0))),
            },
            Request::Read { ino, offset, size } => match self.read(ino, offset, size) {
                Ok(data) => Reply::Data(data),
                Err(err) => Reply::Error(err),
            },
            Request::Flush { .. } | Request::Release { .. } => Reply::Empty,
            Request::Unsupported { opcode } => match Opcode::try_from(opcode) {
                // A known opcode must arrive with its arguments.
                Ok(op) => Reply::Error(SideloadError::Protocol(format!(
                    "{} request without arguments",
                    op.name()
                ))),
                Err(err) => {
                    debug!(opcode, "unimplemented opcode");
                    Reply::Error(err)
                }
            },
        }
    }

    fn lookup(&mut self, parent: InodeNumber, name: &OsStr) -> Result<NodeAttr> {
        if parent != ROOT_INODE {
            return Err(SideloadError::NotFound(format!("parent inode {}", parent.0)));
        }
        if name == self.package_name.as_str() {
            return self.attr(PACKAGE_INODE);
        }
        if name == self.exit_name.as_str() {
            info!("exit sentinel looked up, terminating");
            self.terminated.store(true, Ordering::Release);
            return self.attr(EXIT_INODE);
        }
        Err(SideloadError::NotFound(name.to_string_lossy().into_owned()))
    }

    fn attr(&self, ino: InodeNumber) -> Result<NodeAttr> {
        let blksize = self.extent().block_size();
        match ino {
            ROOT_INODE => Ok(NodeAttr {
                ino,
                size: 4096,
                kind: NodeKind::Directory,
                perm: 0o555,
                nlink: 2,
                blksize,
            }),
            PACKAGE_INODE => Ok(NodeAttr {
                ino,
                size: self.extent().file_size(),
                kind: NodeKind::RegularFile,
                perm: 0o444,
                nlink: 1,
                blksize,
            }),
            EXIT_INODE => Ok(NodeAttr {
                ino,
                size: 0,
                kind: NodeKind::RegularFile,
                perm: 0,
                nlink: 1,
                blksize,
            }),
            other => Err(SideloadError::NotFound(format!("inode {}", other.0))),
        }
    }

    /// Serve `size` bytes at `offset`; never spans more than two blocks
    /// because the mount advertises `max_read = block_size`.
    fn read(&mut self, ino: InodeNumber, offset: u64, size: u32) -> Result<&[u8]> {
        if ino != PACKAGE_INODE {
            return Err(SideloadError::NotFound(format!("inode {}", ino.0)));
        }
        let extent = self.fetcher.extent();
        if size > extent.block_size() {
            return Err(SideloadError::Protocol(format!(
                "read of {size} bytes exceeds block size {}",
                extent.block_size()
            )));
        }

        let block_len = extent.block_len();
        let size = size as usize;
        let block = extent.block_of(offset);
        let block_offset = (offset % u64::from(extent.block_size())) as usize;

        if block_offset + size <= block_len {
            let data = self.fetcher.fetch(block)?;
            return Ok(&data[block_offset..block_offset + size]);
        }

        let next = BlockIndex(
            block
                .0
                .checked_add(1)
                .ok_or_else(|| SideloadError::Protocol(format!("read at {offset} overflows")))?,
        );
        let head_len = block_len - block_offset;
        let first = self.fetcher.fetch(block)?;
        self.extra[..head_len].copy_from_slice(&first[block_offset..]);
        let second = self.fetcher.fetch(next)?;
        self.extra[head_len..size].copy_from_slice(&second[..size - head_len]);
        Ok(&self.extra[..size])
    }
}
