#![forbid(unsafe_code)]
//! Block layer for sideload.
//!
//! Provides the [`BlockProvider`] trait with stream, file and host-request
//! implementations, the memory-budgeted [`BlockCache`], the write-once
//! [`HashLedger`], and the [`BlockFetcher`] that ties them together and
//! enforces read consistency.

pub mod budget;
pub mod cache;
pub mod fetch;
pub mod host;
pub mod ledger;

pub use budget::{available_memory, cache_budget, DEFAULT_MEMORY_RESERVE};
pub use cache::BlockCache;
pub use fetch::{BlockFetcher, FetchStats};
pub use host::{Handshake, HostRequestProvider, HostSender};
pub use ledger::{Digest, HashLedger, LedgerCheck, DIGEST_LEN};

use sfs_error::{Result, SideloadError};
use sfs_types::BlockIndex;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Source of package bytes, addressed by block.
///
/// Implementations are driven by a single-threaded server, so methods take
/// `&mut self`.
pub trait BlockProvider: Send {
    /// Fill `buf` with exactly `buf.len()` bytes of block `index`.
    ///
    /// `buf.len()` is the block size, or the remaining file length for a
    /// final partial block; the caller zero-pads the rest.
    fn read_block(&mut self, index: BlockIndex, buf: &mut [u8]) -> Result<()>;

    /// Release the underlying resources. Further reads fail.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: BlockProvider + ?Sized> BlockProvider for Box<P> {
    fn read_block(&mut self, index: BlockIndex, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(index, buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

fn transport_error(index: BlockIndex, err: &std::io::Error) -> SideloadError {
    SideloadError::Transport {
        block: index.0,
        detail: err.to_string(),
    }
}

fn block_offset(index: BlockIndex, block_size: u32) -> Result<u64> {
    index
        .0
        .checked_mul(u64::from(block_size))
        .ok_or_else(|| SideloadError::Format(format!("block {index} offset overflows u64")))
}

/// Provider over a live, seekable descriptor.
///
/// Every read seeks to `index * block_size` first, so the descriptor's
/// cursor is never trusted between requests.
#[derive(Debug)]
pub struct StreamProvider<S> {
    stream: Option<S>,
    block_size: u32,
}

impl<S: Read + Seek + Send> StreamProvider<S> {
    #[must_use]
    pub fn new(stream: S, block_size: u32) -> Self {
        Self {
            stream: Some(stream),
            block_size,
        }
    }
}

impl<S: Read + Seek + Send> BlockProvider for StreamProvider<S> {
    fn read_block(&mut self, index: BlockIndex, buf: &mut [u8]) -> Result<()> {
        let offset = block_offset(index, self.block_size)?;
        let stream = self.stream.as_mut().ok_or(SideloadError::Closed)?;
        loop {
            match stream.seek(SeekFrom::Start(offset)) {
                Ok(_) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(transport_error(index, &err)),
            }
        }
        // read_exact retries on EINTR and fails on a short stream.
        stream
            .read_exact(buf)
            .map_err(|err| transport_error(index, &err))
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

/// Provider over a pre-existing local package.
///
/// Uses positional reads (`pread`), which need no shared seek position.
#[derive(Debug)]
pub struct FileProvider {
    file: Option<File>,
    len: u64,
    block_size: u32,
}

impl FileProvider {
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Some(file),
            len,
            block_size,
        })
    }

    /// Length of the package in bytes, as seen at open time.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }
}

impl BlockProvider for FileProvider {
    fn read_block(&mut self, index: BlockIndex, buf: &mut [u8]) -> Result<()> {
        let offset = block_offset(index, self.block_size)?;
        let file = self.file.as_ref().ok_or(SideloadError::Closed)?;
        file.read_exact_at(buf, offset)
            .map_err(|err| transport_error(index, &err))
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn stream_provider_seeks_to_block() {
        let data = pattern(4096 * 3);
        let mut provider = StreamProvider::new(Cursor::new(data.clone()), 4096);

        let mut buf = vec![0_u8; 4096];
        provider.read_block(BlockIndex(2), &mut buf).expect("block 2");
        assert_eq!(buf, data[8192..]);
        provider.read_block(BlockIndex(0), &mut buf).expect("block 0");
        assert_eq!(buf, data[..4096]);
    }

    #[test]
    fn stream_provider_short_read_is_transport_error() {
        let mut provider = StreamProvider::new(Cursor::new(vec![1_u8; 100]), 4096);
        let mut buf = vec![0_u8; 4096];
        let err = provider.read_block(BlockIndex(0), &mut buf).unwrap_err();
        assert!(matches!(err, SideloadError::Transport { block: 0, .. }));
    }

    #[test]
    fn closed_stream_provider_rejects_reads() {
        let mut provider = StreamProvider::new(Cursor::new(vec![0_u8; 4096]), 4096);
        provider.close().expect("close");
        let mut buf = vec![0_u8; 16];
        assert!(matches!(
            provider.read_block(BlockIndex(0), &mut buf),
            Err(SideloadError::Closed)
        ));
    }

    #[test]
    fn file_provider_reads_partial_tail() {
        let data = pattern(10_000);
        let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.write_all(&data).expect("write");
        tmp.flush().expect("flush");

        let mut provider = FileProvider::open(tmp.path(), 4096).expect("open");
        assert_eq!(provider.len_bytes(), 10_000);

        let mut tail = vec![0_u8; 10_000 - 8192];
        provider.read_block(BlockIndex(2), &mut tail).expect("tail");
        assert_eq!(tail, data[8192..]);

        let mut past = vec![0_u8; 4096];
        assert!(provider.read_block(BlockIndex(3), &mut past).is_err());
    }

    #[test]
    fn file_provider_missing_path_is_io_error() {
        let err = FileProvider::open("/nonexistent/sideload/package.zip", 4096).unwrap_err();
        assert!(matches!(err, SideloadError::Io(ref e) if e.kind() == ErrorKind::NotFound));
    }
}
