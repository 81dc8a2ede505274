//! Session configuration (SPEC_FULL §10.4).
//!
//! Built once at `begin()`/daemon-start and handed immutably to every
//! thread; nothing in this crate reads ambient global configuration state,
//! generalizing Design Note 9's "no singleton" directive from the state
//! bitset to configuration as well.

use std::time::Duration;

/// Page-size and scheduling parameters shared by both halves of the
/// engine. Page sizes are normally probed from the OS and the UMEM device;
/// the rest are tuning knobs exposed on `postcopy-daemon`'s CLI.
#[derive(Debug, Clone)]
pub struct PostcopyConfig {
    pub host_page_size: u64,
    pub target_page_size: u64,

    /// Number of pages to speculatively send after a faulting offset (§4.2).
    pub prefault_forward: u64,
    /// Number of pages to speculatively send before a faulting offset (§4.2).
    pub prefault_backward: u64,

    /// Wall-clock budget for one background scan slice before yielding to
    /// the demand handler (§4.2, default 50 ms).
    pub background_yield_budget: Duration,

    /// Reposition the background scan cursor near the working set after
    /// serving a demand batch (§4.2 "move-background" mode).
    pub move_background: bool,
}

impl Default for PostcopyConfig {
    fn default() -> Self {
        Self {
            host_page_size: 4096,
            target_page_size: 4096,
            prefault_forward: 0,
            prefault_backward: 0,
            background_yield_budget: Duration::from_millis(50),
            move_background: false,
        }
    }
}

impl PostcopyConfig {
    pub fn geometry(&self) -> postcopy_hal::PageGeometry {
        postcopy_hal::PageGeometry::new(self.host_page_size, self.target_page_size)
    }
}
