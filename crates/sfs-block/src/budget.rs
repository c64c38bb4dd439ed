//! Cache sizing from the device's free memory.

use sfs_error::{Result, SideloadError};
use sfs_types::FileExtent;
use std::path::Path;

/// Memory kept back for the installer itself (256 MiB).
pub const DEFAULT_MEMORY_RESERVE: u64 = 256 * 1024 * 1024;

/// Bytes of bookkeeping per file block (cache slot plus ledger entry).
const PER_BLOCK_OVERHEAD: u64 = (std::mem::size_of::<Option<Box<[u8]>>>()
    + std::mem::size_of::<Option<crate::Digest>>()) as u64;

/// Number of blocks the cache may hold, or 0 to disable caching.
///
/// `budget = (available - reserve - bookkeeping) / block_size`, capped at
/// `file_blocks`. Caching is disabled when the subtraction underflows or the
/// budget is below `max(2, file_blocks / 100)`: a cache that small costs more
/// in bookkeeping than it saves.
#[must_use]
pub fn cache_budget(available: u64, reserve: u64, extent: FileExtent) -> usize {
    let file_blocks = extent.file_blocks();
    let bookkeeping = file_blocks.saturating_mul(PER_BLOCK_OVERHEAD);
    let Some(usable) = reserve
        .checked_add(bookkeeping)
        .and_then(|fixed| available.checked_sub(fixed))
    else {
        return 0;
    };

    let budget = (usable / u64::from(extent.block_size())).min(file_blocks);
    if budget < 2 || budget < file_blocks / 100 {
        return 0;
    }
    usize::try_from(budget).unwrap_or(0)
}

/// Memory the kernel reports as available, in bytes.
///
/// Reads `/proc/meminfo`.
pub fn available_memory() -> Result<u64> {
    available_memory_from(Path::new("/proc/meminfo"))
}

pub(crate) fn available_memory_from(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path)?;
    parse_meminfo(&text).ok_or_else(|| {
        SideloadError::Format(format!("no usable memory figures in {}", path.display()))
    })
}

/// Parse `MemAvailable`, falling back to `MemFree + Buffers + Cached` on
/// kernels that predate it. Values are in KiB.
fn parse_meminfo(text: &str) -> Option<u64> {
    let field = |name: &str| -> Option<u64> {
        text.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            kib.checked_mul(1024)
        })
    };

    if let Some(available) = field("MemAvailable") {
        return Some(available);
    }
    let free = field("MemFree")?;
    let buffers = field("Buffers").unwrap_or(0);
    let cached = field("Cached").unwrap_or(0);
    Some(free.saturating_add(buffers).saturating_add(cached))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn budget_capped_at_file_blocks() {
        let extent = FileExtent::new(10 * MIB, 64 * 1024).expect("extent");
        let budget = cache_budget(4096 * MIB, DEFAULT_MEMORY_RESERVE, extent);
        assert_eq!(budget as u64, extent.file_blocks());
    }

    #[test]
    fn budget_limited_by_free_memory() {
        let extent = FileExtent::new(1024 * MIB, MIB as u32).expect("extent");
        // 300 MiB available, 256 MiB reserved: about 43 one-MiB blocks left.
        let budget = cache_budget(300 * MIB, DEFAULT_MEMORY_RESERVE, extent);
        assert!((40..=44).contains(&budget), "budget {budget}");
    }

    #[test]
    fn underflow_disables_cache() {
        let extent = FileExtent::new(100 * MIB, 4096).expect("extent");
        assert_eq!(cache_budget(100 * MIB, DEFAULT_MEMORY_RESERVE, extent), 0);
    }

    #[test]
    fn tiny_budget_disables_cache() {
        // One block of headroom is never worth caching.
        let extent = FileExtent::new(100 * MIB, MIB as u32).expect("extent");
        assert_eq!(cache_budget(257 * MIB + MIB / 2, 256 * MIB, extent), 0);
    }

    #[test]
    fn budget_below_one_percent_disables_cache() {
        // 100_000 blocks need at least 1000 cached; give room for ~500.
        let extent = FileExtent::new(100_000 * 4096, 4096).expect("extent");
        let bookkeeping = extent.file_blocks() * PER_BLOCK_OVERHEAD;
        let available = DEFAULT_MEMORY_RESERVE + bookkeeping + 500 * 4096;
        assert_eq!(cache_budget(available, DEFAULT_MEMORY_RESERVE, extent), 0);
        let available = DEFAULT_MEMORY_RESERVE + bookkeeping + 1000 * 4096;
        assert_eq!(cache_budget(available, DEFAULT_MEMORY_RESERVE, extent), 1000);
    }

    #[test]
    fn meminfo_prefers_mem_available() {
        let text = "MemTotal:        2000 kB\nMemFree:          100 kB\nMemAvailable:     900 kB\nBuffers:           10 kB\nCached:            20 kB\n";
        assert_eq!(parse_meminfo(text), Some(900 * 1024));
    }

    #[test]
    fn meminfo_falls_back_to_free_buffers_cached() {
        let text = "MemTotal: 2000 kB\nMemFree: 100 kB\nBuffers: 10 kB\nCached: 20 kB\nSwapCached: 5 kB\n";
        assert_eq!(parse_meminfo(text), Some(130 * 1024));
    }

    #[test]
    fn meminfo_without_figures_is_none() {
        assert_eq!(parse_meminfo("Garbage: 1 kB\n"), None);
    }

    #[test]
    fn meminfo_file_read() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("meminfo");
        std::fs::write(&path, "MemAvailable: 4 kB\n").expect("write");
        assert_eq!(available_memory_from(&path).expect("read"), 4096);
    }
}
