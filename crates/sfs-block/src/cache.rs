//! Memory-budgeted block cache.
//!
//! Slots are indexed directly by block number; each resident block is an
//! owned boxed slice moved in on insert and dropped on eviction. The number
//! of resident blocks never exceeds the budget.
//!
//! Eviction is tuned for sequential forward reads: starting at the block just
//! behind the one being inserted, scan backward for the first resident entry,
//! wrapping around to the end of the file if nothing is found.

use sfs_types::BlockIndex;

#[derive(Debug)]
pub struct BlockCache {
    slots: Vec<Option<Box<[u8]>>>,
    budget: usize,
    resident: usize,
}

impl BlockCache {
    /// Cache for a file of `file_blocks` blocks holding at most `budget`.
    ///
    /// A zero budget yields a disabled cache with no slot table.
    #[must_use]
    pub fn new(file_blocks: usize, budget: usize) -> Self {
        let slots = if budget == 0 {
            Vec::new()
        } else {
            vec![None; file_blocks]
        };
        Self {
            slots,
            budget,
            resident: 0,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.budget > 0
    }

    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Number of resident blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resident
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resident == 0
    }

    #[must_use]
    pub fn get(&self, index: BlockIndex) -> Option<&[u8]> {
        self.slot_index(index)
            .and_then(|i| self.slots[i].as_deref())
    }

    #[must_use]
    pub fn contains(&self, index: BlockIndex) -> bool {
        self.get(index).is_some()
    }

    /// Store `data` for `index`, evicting one entry first if the cache is
    /// full. Returns the evicted block, if any.
    ///
    /// Inserting into a disabled cache, or past the slot table, is a no-op.
    pub fn insert(&mut self, index: BlockIndex, data: Box<[u8]>) -> Option<BlockIndex> {
        let slot = self.slot_index(index)?;
        if self.slots[slot].is_some() {
            self.slots[slot] = Some(data);
            return None;
        }

        let mut evicted = None;
        if self.resident >= self.budget {
            if let Some(victim) = self.pick_victim(slot) {
                self.slots[victim] = None;
                self.resident -= 1;
                evicted = Some(BlockIndex(victim as u64));
            }
        }
        // Budget >= 2 whenever caching is enabled, so a victim always exists
        // once the cache is full.
        if self.resident < self.budget {
            self.slots[slot] = Some(data);
            self.resident += 1;
        }
        evicted
    }

    fn slot_index(&self, index: BlockIndex) -> Option<usize> {
        usize::try_from(index.0)
            .ok()
            .filter(|&i| i < self.slots.len())
    }

    fn pick_victim(&self, current: usize) -> Option<usize> {
        (0..current)
            .rev()
            .chain((current + 1..self.slots.len()).rev())
            .find(|&i| self.slots[i].is_some())
    }
}
