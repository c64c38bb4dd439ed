#![forbid(unsafe_code)]
//! Error types for the sideload filesystem.
//!
//! # Error Taxonomy
//!
//! Sideload uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Geometry | `ParseError` | `sfs-types` | Invalid extents, block sizes and host handshakes |
//! | Runtime | `SideloadError` | `sfs-error` (this crate) | Errors surfaced as FUSE replies and CLI failures |
//!
//! Session-level conditions (timeout, cancellation, a companion process that
//! died) never become a `SideloadError`: the session controller translates
//! them directly into its three result codes.
//!
//! ## FUSE errno Mapping
//!
//! Every `SideloadError` variant maps to exactly one POSIX errno via
//! [`SideloadError::to_errno`]. The mapping is exhaustive (no wildcard arms)
//! so adding a new variant is a compile error until its errno is assigned.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `Io` | `EIO` (or the OS errno) | 5 |
//! | `Transport` | `EIO` | 5 |
//! | `Integrity` | `EIO` | 5 |
//! | `Protocol` | `EINVAL` | 22 |
//! | `Format` | `EINVAL` | 22 |
//! | `NotFound` | `ENOENT` | 2 |
//! | `PermissionDenied` | `EPERM` | 1 |
//! | `Unimplemented` | `ENOSYS` | 38 |
//! | `Closed` | `EIO` | 5 |
//!
//! ## Propagation Policy
//!
//! The protocol server never aborts on a `SideloadError`; it replies with the
//! mapped errno and keeps serving. A failed fetch is not retried: the host
//! has to restart the whole side-load.

use thiserror::Error;

/// Unified error type for block fetches and protocol handling.
#[derive(Debug, Error)]
pub enum SideloadError {
    /// Operating system I/O error outside of a block fetch.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block provider failed to deliver a block (seek, read, or the host
    /// stream went away).
    #[error("transport failure at block {block}: {detail}")]
    Transport { block: u64, detail: String },

    /// A re-read block disagrees with the digest recorded on its first read.
    ///
    /// Always fatal to the fetch. The ledger entry is left untouched and the
    /// inconsistent bytes are never handed to a caller.
    #[error("block {block} hash mismatch: source changed bytes between reads")]
    Integrity { block: u64 },

    /// Malformed or out-of-range request (e.g. a READ larger than one block).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid geometry or handshake.
    #[error("invalid format: {0}")]
    Format(String),

    /// Name or inode not exposed by the sideload mount.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation refused on this node (opening the exit sentinel).
    #[error("operation not permitted")]
    PermissionDenied,

    /// Request opcode the server does not implement.
    #[error("unimplemented opcode {0}")]
    Unimplemented(u32),

    /// The provider was already closed.
    #[error("block provider closed")]
    Closed,
}

impl SideloadError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// Policy notes:
    /// - `Integrity` → `EIO`: the reader sees a plain I/O failure, never bytes.
    /// - `Protocol` → `EINVAL`: the request is dropped, the server continues.
    /// - `PermissionDenied` → `EPERM`: the exit sentinel cannot be opened.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Transport { .. } | Self::Integrity { .. } | Self::Closed => libc::EIO,
            Self::Protocol(_) | Self::Format(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EPERM,
            Self::Unimplemented(_) => libc::ENOSYS,
        }
    }

    /// Whether this error came from the integrity ledger.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

/// Result alias using `SideloadError`.
pub type Result<T> = std::result::Result<T, SideloadError>;
