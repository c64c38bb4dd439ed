#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Smallest block size a host may request.
pub const MIN_BLOCK_SIZE: u32 = 1024;
/// Largest block size a host may request (4 MiB).
pub const MAX_BLOCK_SIZE: u32 = 4 * 1024 * 1024;
/// Block size used when serving a local package.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Private mountpoint the protocol server attaches to.
pub const DEFAULT_MOUNTPOINT: &str = "/sideload";
/// Name of the exposed package file under the mountpoint.
pub const PACKAGE_FILE_NAME: &str = "package.zip";
/// Name of the shutdown sentinel under the mountpoint.
pub const EXIT_FILE_NAME: &str = "exit";

/// Root directory inode.
pub const ROOT_INODE: InodeNumber = InodeNumber(1);
/// The exposed package file.
pub const PACKAGE_INODE: InodeNumber = InodeNumber(2);
/// The shutdown sentinel.
pub const EXIT_INODE: InodeNumber = InodeNumber(3);

/// Companion exit status reported when the host speaks a protocol revision
/// that predates host-side block serving.
pub const EXIT_HOST_TOO_OLD: i32 = 3;

/// Mode flag that turns the recovery executable into the side-load transport
/// daemon instead of running normal startup.
pub const DAEMON_MODE_FLAG: &str = "--sideload-daemon";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Size and block geometry of the package being side-loaded.
///
/// `block_size` is validated to lie in `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`.
/// It does not need to be a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileExtent {
    file_size: u64,
    block_size: u32,
}

impl FileExtent {
    pub fn new(file_size: u64, block_size: u32) -> Result<Self, ParseError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be in 1024..=4194304",
            });
        }
        // Every block index must be addressable as a byte offset.
        if file_size.checked_add(u64::from(block_size)).is_none() {
            return Err(ParseError::InvalidField {
                field: "file_size",
                reason: "too large for block addressing",
            });
        }
        Ok(Self {
            file_size,
            block_size,
        })
    }

    #[must_use]
    pub fn file_size(self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        self.block_size
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn block_len(self) -> usize {
        // MAX_BLOCK_SIZE fits any supported usize.
        self.block_size as usize
    }

    /// `ceil(file_size / block_size)`.
    #[must_use]
    pub fn file_blocks(self) -> u64 {
        self.file_size.div_ceil(u64::from(self.block_size))
    }

    /// Block containing `byte_offset`.
    #[must_use]
    pub fn block_of(self, byte_offset: u64) -> BlockIndex {
        BlockIndex(byte_offset / u64::from(self.block_size))
    }

    /// Byte offset of the first byte in `block`.
    #[must_use]
    pub fn block_start(self, block: BlockIndex) -> Option<u64> {
        block.0.checked_mul(u64::from(self.block_size))
    }

    /// Number of bytes of real file data inside `block`.
    ///
    /// Equal to `block_size` for every block but the last, shorter for a
    /// final partial block, zero past end-of-file.
    #[must_use]
    pub fn data_len(self, block: BlockIndex) -> usize {
        let Some(start) = self.block_start(block) else {
            return 0;
        };
        if start >= self.file_size {
            return 0;
        }
        let remaining = self.file_size - start;
        // Bounded by block_size, which fits usize.
        remaining.min(u64::from(self.block_size)) as usize
    }

    #[must_use]
    pub fn contains(self, block: BlockIndex) -> bool {
        block.0 < self.file_blocks()
    }
}
