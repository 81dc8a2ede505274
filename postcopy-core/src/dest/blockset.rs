//! A fixed table of memory blocks, addressable by id (request-stream
//! lookups) or by absolute host-page offset (fault-pipe round trips, which
//! carry offsets relative to the whole mapped guest-RAM address space
//! rather than to any one block).

use std::collections::HashMap;

use crate::block::MemoryBlock;

pub struct BlockSet {
    by_id: HashMap<String, MemoryBlock>,
}

impl BlockSet {
    pub fn new(blocks: Vec<MemoryBlock>) -> Self {
        let by_id = blocks.into_iter().map(|b| (b.id.clone(), b)).collect();
        Self { by_id }
    }

    pub fn get(&self, id: &str) -> Option<&MemoryBlock> {
        self.by_id.get(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.by_id.values()
    }

    /// Every host page across every block has been released (§4.4.5 "all
    /// blocks finished" predicate).
    pub fn all_finished(&self) -> bool {
        self.by_id.values().all(|b| b.umem_shmem_finished())
    }

    /// Translate a block-local host-page index to an absolute host-page
    /// offset in the combined guest-RAM address space.
    pub fn abs_host_offset(&self, block: &MemoryBlock, local_host_idx: u64, host_page_size: u64) -> u64 {
        block.offset / host_page_size + local_host_idx
    }

    /// Find the block containing absolute host-page offset `abs`, and the
    /// block-local host-page index within it.
    pub fn find_by_abs_host_offset(&self, abs: u64, host_page_size: u64) -> Option<(&MemoryBlock, u64)> {
        self.by_id.values().find_map(|b| {
            let base = b.offset / host_page_size;
            let host_pages = (b.length / host_page_size).max(1);
            if abs >= base && abs < base + host_pages {
                Some((b, abs - base))
            } else {
                None
            }
        })
    }
}
