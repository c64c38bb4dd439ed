//! Write-once per-block digest ledger.
//!
//! The first successful read of a block records its blake3 digest. Every
//! later read of the same block must reproduce that digest, otherwise the
//! fetch fails and the entry stays as it was. This defends against a host
//! that serves different bytes for the same offset on repeated access.
//!
//! The digest is a read-consistency check only; package authenticity is
//! verified later by the installer.

use sfs_error::{Result, SideloadError};
use sfs_types::BlockIndex;

/// Length in bytes of a block digest.
pub const DIGEST_LEN: usize = blake3::OUT_LEN;

/// Fixed-length block digest.
pub type Digest = [u8; DIGEST_LEN];

/// Hash `bytes` into a ledger digest.
#[must_use]
pub fn digest(bytes: &[u8]) -> Digest {
    *blake3::hash(bytes).as_bytes()
}

/// Outcome of a successful ledger check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerCheck {
    /// First sighting; the digest is now recorded.
    Recorded,
    /// Matches the previously recorded digest.
    Matched,
}

#[derive(Debug)]
pub struct HashLedger {
    entries: Vec<Option<Digest>>,
}

impl HashLedger {
    pub fn new(file_blocks: u64) -> Result<Self> {
        let len = usize::try_from(file_blocks)
            .map_err(|_| SideloadError::Format(format!("{file_blocks} blocks do not fit usize")))?;
        Ok(Self {
            entries: vec![None; len],
        })
    }

    /// Recorded digest for `index`, if the block has been seen.
    #[must_use]
    pub fn get(&self, index: BlockIndex) -> Option<&Digest> {
        self.slot(index).and_then(Option::as_ref)
    }

    /// Number of blocks with a recorded digest.
    #[must_use]
    pub fn recorded(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Verify `digest` against the entry for `index`, recording it if unseen.
    ///
    /// A mismatch returns [`SideloadError::Integrity`] and leaves the entry
    /// unchanged.
    pub fn verify_or_record(&mut self, index: BlockIndex, digest: &Digest) -> Result<LedgerCheck> {
        let slot = usize::try_from(index.0)
            .ok()
            .and_then(|i| self.entries.get_mut(i))
            .ok_or_else(|| {
                SideloadError::Protocol(format!("block {index} outside ledger"))
            })?;
        match slot {
            Some(recorded) if recorded == digest => Ok(LedgerCheck::Matched),
            Some(_) => Err(SideloadError::Integrity { block: index.0 }),
            None => {
                *slot = Some(*digest);
                Ok(LedgerCheck::Recorded)
            }
        }
    }

    fn slot(&self, index: BlockIndex) -> Option<&Option<Digest>> {
        usize::try_from(index.0)
            .ok()
            .and_then(|i| self.entries.get(i))
    }
}
