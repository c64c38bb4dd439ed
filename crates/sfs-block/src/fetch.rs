//! Verified block fetching.
//!
//! [`BlockFetcher`] owns the provider, the cache and the ledger, and keeps
//! one "current" block buffer that the protocol server replies from.
//!
//! Invariant: the current buffer always holds the bytes of `last_served`.
//! Provider reads land in a separate scratch buffer and only replace the
//! current block once the ledger has accepted them, so a failed fetch never
//! clobbers what was last served.

use crate::cache::BlockCache;
use crate::ledger::{digest, HashLedger, LedgerCheck};
use crate::BlockProvider;
use sfs_error::{Result, SideloadError};
use sfs_types::{BlockIndex, FileExtent};
use tracing::{debug, trace, warn};

/// Counters describing fetch behaviour over a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub provider_reads: u64,
    pub cache_hits: u64,
    pub repeat_hits: u64,
    pub evictions: u64,
    pub integrity_failures: u64,
    pub transport_failures: u64,
}

pub struct BlockFetcher<P> {
    provider: P,
    extent: FileExtent,
    ledger: HashLedger,
    cache: BlockCache,
    current: Box<[u8]>,
    scratch: Box<[u8]>,
    last_served: Option<BlockIndex>,
    closed: bool,
    stats: FetchStats,
}

impl<P> std::fmt::Debug for BlockFetcher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFetcher")
            .field("extent", &self.extent)
            .field("cache_budget", &self.cache.budget())
            .field("cache_len", &self.cache.len())
            .field("last_served", &self.last_served)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<P: BlockProvider> BlockFetcher<P> {
    /// Build a fetcher holding at most `cache_budget` cached blocks.
    ///
    /// Pass the result of [`crate::cache_budget`]; zero disables caching.
    pub fn new(provider: P, extent: FileExtent, cache_budget: usize) -> Result<Self> {
        let file_blocks = usize::try_from(extent.file_blocks()).map_err(|_| {
            SideloadError::Format(format!("{} blocks do not fit usize", extent.file_blocks()))
        })?;
        let cache = BlockCache::new(file_blocks, cache_budget.min(file_blocks));
        debug!(
            file_size = extent.file_size(),
            block_size = extent.block_size(),
            file_blocks,
            cache_budget = cache.budget(),
            "block fetcher ready"
        );
        Ok(Self {
            provider,
            extent,
            ledger: HashLedger::new(extent.file_blocks())?,
            cache,
            current: vec![0_u8; extent.block_len()].into_boxed_slice(),
            scratch: vec![0_u8; extent.block_len()].into_boxed_slice(),
            last_served: None,
            closed: false,
            stats: FetchStats::default(),
        })
    }

    #[must_use]
    pub fn extent(&self) -> FileExtent {
        self.extent
    }

    #[must_use]
    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    #[must_use]
    pub fn last_served(&self) -> Option<BlockIndex> {
        self.last_served
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    #[must_use]
    pub fn ledger(&self) -> &HashLedger {
        &self.ledger
    }

    /// Bytes of the last successfully served block (all zero before the
    /// first fetch).
    #[must_use]
    pub fn current(&self) -> &[u8] {
        &self.current
    }

    /// Fetch block `index` and return its full, zero-padded contents.
    pub fn fetch(&mut self, index: BlockIndex) -> Result<&[u8]> {
        if self.last_served == Some(index) {
            self.stats.repeat_hits += 1;
            return Ok(&self.current);
        }

        if !self.extent.contains(index) {
            trace!(block = index.0, "synthesizing zero block past end of file");
            self.current.fill(0);
            self.last_served = Some(index);
            return Ok(&self.current);
        }

        if let Some(cached) = self.cache.get(index) {
            self.current.copy_from_slice(cached);
            self.last_served = Some(index);
            self.stats.cache_hits += 1;
            return Ok(&self.current);
        }

        if self.closed {
            return Err(SideloadError::Closed);
        }

        let fetch_len = self.extent.data_len(index);
        self.stats.provider_reads += 1;
        if let Err(err) = self
            .provider
            .read_block(index, &mut self.scratch[..fetch_len])
        {
            self.stats.transport_failures += 1;
            warn!(block = index.0, error = %err, "block provider read failed");
            return Err(err);
        }
        self.scratch[fetch_len..].fill(0);

        let block_digest = digest(&self.scratch);
        match self.ledger.verify_or_record(index, &block_digest) {
            Ok(LedgerCheck::Recorded) => trace!(block = index.0, "recorded block digest"),
            Ok(LedgerCheck::Matched) => trace!(block = index.0, "block digest matched"),
            Err(err) => {
                if err.is_integrity() {
                    self.stats.integrity_failures += 1;
                }
                warn!(block = index.0, error = %err, "refusing to serve block");
                return Err(err);
            }
        }

        std::mem::swap(&mut self.current, &mut self.scratch);
        self.last_served = Some(index);
        if self.cache.is_enabled() {
            if let Some(evicted) = self.cache.insert(index, Box::from(&self.current[..])) {
                self.stats.evictions += 1;
                trace!(block = index.0, evicted = evicted.0, "evicted cached block");
            }
        }
        Ok(&self.current)
    }

    /// Close the provider. Idempotent; cached blocks stay readable.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(
            stats = ?self.stats,
            recorded_digests = self.ledger.recorded(),
            "closing block provider"
        );
        self.provider.close()
    }
}
