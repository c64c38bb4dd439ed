//! Host request/reply transport.
//!
//! After a one-line handshake (`sideload-host:<file_size>:<block_size>`),
//! the device asks for a block by writing its index as eight ASCII decimal
//! digits and the host answers with exactly the block's bytes (shorter for
//! the final block). The device ends the session by writing `DONEDONE`.
//!
//! Older hosts announce `sideload:<file_size>` and expect to push the whole
//! package; that revision is recognised so the daemon can refuse it with a
//! dedicated exit status.

use crate::BlockProvider;
use sfs_error::{Result, SideloadError};
use sfs_types::{BlockIndex, FileExtent};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::FileExt;
use tracing::{debug, info};

const HOST_PREFIX: &str = "sideload-host:";
const LEGACY_PREFIX: &str = "sideload:";
const MAX_HANDSHAKE_LEN: usize = 128;
const REQUEST_LEN: usize = 8;
const MAX_REQUEST_INDEX: u64 = 99_999_999;
const DONE_MARKER: &[u8; REQUEST_LEN] = b"DONEDONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Host serves blocks on request.
    Host { file_size: u64, block_size: u32 },
    /// Host predates block serving.
    Legacy { file_size: u64 },
}

impl Handshake {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix(HOST_PREFIX) {
            let (size, block) = rest
                .split_once(':')
                .ok_or_else(|| SideloadError::Format(format!("malformed handshake {line:?}")))?;
            let file_size = parse_number(size, "file size")?;
            let block_size = u32::try_from(parse_number(block, "block size")?)
                .map_err(|_| SideloadError::Format(format!("block size {block} too large")))?;
            return Ok(Self::Host {
                file_size,
                block_size,
            });
        }
        if let Some(size) = line.strip_prefix(LEGACY_PREFIX) {
            return Ok(Self::Legacy {
                file_size: parse_number(size, "file size")?,
            });
        }
        Err(SideloadError::Format(format!("unknown handshake {line:?}")))
    }

    /// Read one newline-terminated handshake, byte by byte so nothing past
    /// the newline is consumed.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut line = Vec::with_capacity(64);
        let mut byte = [0_u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => {
                    return Err(SideloadError::Format(
                        "host closed connection during handshake".to_owned(),
                    ))
                }
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if line.len() > MAX_HANDSHAKE_LEN {
                        return Err(SideloadError::Format("handshake too long".to_owned()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        let line = String::from_utf8(line)
            .map_err(|_| SideloadError::Format("handshake is not UTF-8".to_owned()))?;
        Self::parse(&line)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let line = match self {
            Self::Host {
                file_size,
                block_size,
            } => format!("{HOST_PREFIX}{file_size}:{block_size}\n"),
            Self::Legacy { file_size } => format!("{LEGACY_PREFIX}{file_size}\n"),
        };
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Geometry announced by a block-serving host.
    pub fn extent(&self) -> Result<FileExtent> {
        match *self {
            Self::Host {
                file_size,
                block_size,
            } => FileExtent::new(file_size, block_size)
                .map_err(|err| SideloadError::Format(err.to_string())),
            Self::Legacy { .. } => Err(SideloadError::Format(
                "legacy host does not serve blocks".to_owned(),
            )),
        }
    }
}

fn parse_number(text: &str, what: &str) -> Result<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| SideloadError::Format(format!("invalid {what} {text:?}")))
}

fn encode_request(index: BlockIndex) -> Result<[u8; REQUEST_LEN]> {
    if index.0 > MAX_REQUEST_INDEX {
        return Err(SideloadError::Protocol(format!(
            "block {index} not expressible in an 8-digit request"
        )));
    }
    let mut out = [0_u8; REQUEST_LEN];
    out.copy_from_slice(format!("{:08}", index.0).as_bytes());
    Ok(out)
}

fn decode_request(raw: &[u8; REQUEST_LEN]) -> Result<BlockIndex> {
    std::str::from_utf8(raw)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u64>().ok())
        .map(BlockIndex)
        .ok_or_else(|| SideloadError::Protocol(format!("malformed block request {raw:?}")))
}

/// Device-side provider that requests each block from the host.
#[derive(Debug)]
pub struct HostRequestProvider<S> {
    stream: Option<S>,
}

impl<S: Read + Write + Send> HostRequestProvider<S> {
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl<S: Read + Write + Send> BlockProvider for HostRequestProvider<S> {
    fn read_block(&mut self, index: BlockIndex, buf: &mut [u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(SideloadError::Closed)?;
        let request = encode_request(index)?;
        let transport = |err: std::io::Error| SideloadError::Transport {
            block: index.0,
            detail: err.to_string(),
        };
        stream.write_all(&request).map_err(transport)?;
        stream.flush().map_err(transport)?;
        stream.read_exact(buf).map_err(transport)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.write_all(DONE_MARKER)?;
            stream.flush()?;
        }
        Ok(())
    }
}

/// Host side of the transport: answers block requests from a local package.
#[derive(Debug)]
pub struct HostSender<S> {
    package: File,
    extent: FileExtent,
    stream: S,
}

impl<S: Read + Write> HostSender<S> {
    pub fn new(package: File, block_size: u32, stream: S) -> Result<Self> {
        let len = package.metadata()?.len();
        let extent = FileExtent::new(len, block_size)
            .map_err(|err| SideloadError::Format(err.to_string()))?;
        Ok(Self {
            package,
            extent,
            stream,
        })
    }

    #[must_use]
    pub fn extent(&self) -> FileExtent {
        self.extent
    }

    /// Send the handshake, then serve requests until the device says it is
    /// done or hangs up. Returns the number of blocks sent.
    pub fn run(&mut self) -> Result<u64> {
        Handshake::Host {
            file_size: self.extent.file_size(),
            block_size: self.extent.block_size(),
        }
        .write_to(&mut self.stream)?;
        info!(
            file_size = self.extent.file_size(),
            block_size = self.extent.block_size(),
            "handshake sent, serving block requests"
        );

        let mut buf = vec![0_u8; self.extent.block_len()];
        let mut served = 0_u64;
        loop {
            let mut raw = [0_u8; REQUEST_LEN];
            match self.stream.read_exact(&mut raw) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    debug!(served, "device hung up");
                    return Ok(served);
                }
                Err(err) => return Err(err.into()),
            }
            if &raw == DONE_MARKER {
                debug!(served, "device finished");
                return Ok(served);
            }

            let index = decode_request(&raw)?;
            if !self.extent.contains(index) {
                return Err(SideloadError::Protocol(format!(
                    "device requested block {index} of {}",
                    self.extent.file_blocks()
                )));
            }
            let len = self.extent.data_len(index);
            let offset = self.extent.block_start(index).unwrap_or(0);
            self.package.read_exact_at(&mut buf[..len], offset)?;
            self.stream.write_all(&buf[..len])?;
            self.stream.flush()?;
            served += 1;
        }
    }
}
