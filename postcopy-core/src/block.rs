//! Memory block: a contiguous region of guest physical memory plus the four
//! bitmaps that track its per-target-page state (spec §3).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use postcopy_hal::PageGeometry;

use crate::bitmap::AtomicBitmap;

/// A handle onto the shared-memory region backing one block's guest RAM.
/// Writes arrive only from the mig-read thread (§5); the single-byte
/// "force-fault" read comes from the destination fault ingestor (§4.3).
/// Both are real concurrent accesses to the same bytes, ordered only by the
/// fault-write pipe notification, so this type is `Send + Sync` by
/// construction rather than by interior mutability: callers are relied on
/// to respect the ordering the pipe protocol establishes.
pub struct SharedMemory {
    base: *mut u8,
    len: usize,
    owned: bool,
}

// SAFETY: the pointer is never dereferenced across the block's lifetime
// without following the fault-write/fault-read handshake that this crate's
// threads implement; see the module doc above.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Wrap a raw shared-memory mapping. `base` must be valid for `len`
    /// bytes for the lifetime of this value.
    ///
    /// # Safety
    /// The caller must guarantee `base` points at a mapping of at least
    /// `len` bytes that outlives this `SharedMemory`.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len, owned: false }
    }

    /// Build an owned, heap-backed region for tests and for daemon-less
    /// library use (no real UMEM mapping available).
    pub fn new_heap(len: usize) -> Self {
        let mut buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_mut_ptr();
        std::mem::forget(buf);
        Self { base, len, owned: true }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the region at byte `offset` (mig-read thread only).
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        assert!(offset + data.len() <= self.len, "write past end of shared memory region");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
    }

    /// Force-read a single byte to fault the page into the reader's own
    /// page tables (the ingestor's purpose in §4.3).
    pub fn force_read_byte(&self, offset: u64) -> u8 {
        let offset = offset as usize;
        assert!(offset < self.len, "force-read past end of shared memory region");
        unsafe { std::ptr::read_volatile(self.base.add(offset)) }
    }

    /// Read `len` bytes starting at `offset` (source-side page serialization).
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let offset = offset as usize;
        assert!(offset + len <= self.len, "read past end of shared memory region");
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // Heap-backed regions created by `new_heap` are reclaimed here;
        // regions built from `from_raw` are owned by whatever mapped them
        // (the UMEM device) and are left alone.
        if self.owned {
            unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(self.base, self.len)));
            }
        }
    }
}

/// A contiguous region of guest physical memory (spec §3).
pub struct MemoryBlock {
    pub id: String,
    pub offset: u64,
    pub length: u64,
    pub shmem: SharedMemory,
    pub geometry: PageGeometry,

    /// A demand request has been emitted to the source for this target page.
    pub phys_requested: AtomicBitmap,
    /// A page payload has been stored into shared memory for this target page.
    pub phys_received: AtomicBitmap,
    /// Pages known clean at post-copy hand-off (absent if pre-copy was skipped).
    pub clean_bitmap: Option<AtomicBitmap>,
    /// Host-page offsets whose "now cached" notification overflowed the
    /// fault-write pipe and is queued for the pending-clean thread.
    pub pending_clean_bitmap: AtomicBitmap,
    pub nr_pending_clean: AtomicUsize,

    /// Host-page offsets this block still owns UMEM backing for; once
    /// empty `umem_shmem_finished` is `true` (§4.4.5).
    outstanding_host_pages: Mutex<usize>,
}

impl MemoryBlock {
    /// Create a freshly-allocated block with no pages yet requested or
    /// received and no clean bitmap (pre-copy skipped).
    pub fn new(id: impl Into<String>, offset: u64, length: u64, geometry: PageGeometry, shmem: SharedMemory) -> Self {
        let id = id.into();
        assert!(id.len() <= crate::codec::MAX_ID_LEN, "block id exceeds wire limit");
        assert_eq!(length % geometry.target_page_size(), 0, "block length must be a multiple of the target page size");

        let target_pages = geometry.target_pages(length);
        let host_pages = (length / geometry.host_page_size()).max(1);

        Self {
            id,
            offset,
            length,
            shmem,
            geometry,
            phys_requested: AtomicBitmap::new(target_pages),
            phys_received: AtomicBitmap::new(target_pages),
            clean_bitmap: None,
            pending_clean_bitmap: AtomicBitmap::new(host_pages),
            nr_pending_clean: AtomicUsize::new(0),
            outstanding_host_pages: Mutex::new(host_pages as usize),
        }
    }

    /// Install a clean bitmap loaded from the pre-copy hand-off transfer
    /// (§4.6). Overwrites `phys_received`/`phys_requested` to match, per
    /// data-model invariant 4.
    pub fn install_clean_bitmap(&mut self, bits: AtomicBitmap) {
        self.phys_received.copy_from(&bits);
        self.phys_requested.copy_from(&bits);
        self.clean_bitmap = Some(bits);
    }

    pub fn target_pages(&self) -> u64 {
        self.geometry.target_pages(self.length)
    }

    /// Whether target page `tp` is already known present, either via the
    /// clean-bitmap fast path or because it has already been received.
    pub fn is_known_present(&self, tp: u64) -> bool {
        self.phys_received.is_set(tp)
            || self.clean_bitmap.as_ref().is_some_and(|cb| cb.is_set(tp))
    }

    /// Mark `count` host pages as no longer needing UMEM backing (§4.4.5
    /// `remove_shmem`). Returns `true` once every host page in the block
    /// has been released.
    pub fn release_host_pages(&self, count: usize) -> bool {
        let mut outstanding = self.outstanding_host_pages.lock().unwrap();
        *outstanding = outstanding.saturating_sub(count);
        *outstanding == 0
    }

    pub fn umem_shmem_finished(&self) -> bool {
        *self.outstanding_host_pages.lock().unwrap() == 0
    }
}
