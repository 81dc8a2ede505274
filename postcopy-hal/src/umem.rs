//! The UMEM capability (spec §6) — the guest-memory userfault device.
//!
//! UMEM itself is explicitly out of scope for this engine (spec §1): it is a
//! collaborator. This module defines only the capability surface the
//! destination daemon threads (§4.4) need, as a trait, so that a real
//! userfault-backed implementation can be dropped in without touching any of
//! `postcopy-core`.

use std::os::unix::io::RawFd;

use thiserror::Error;

/// A batch of raw page offsets read back from, or handed to, the UMEM
/// device. Offsets are always expressed in the unit the call site documents
/// (host-page offsets unless stated otherwise).
pub type FaultBatch = Vec<u64>;

#[derive(Debug, Error)]
pub enum UmemError {
    #[error("UMEM device unavailable: {0}")]
    Unavailable(String),
    #[error("UMEM I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("UMEM operation attempted on an unmapped region")]
    NotMapped,
}

/// Capability surface of the guest-memory userfault device.
///
/// Implementations back guest RAM with a mechanism the kernel can fault
/// into on demand (e.g. `userfaultfd(2)`) and expose a pollable descriptor
/// so the mig-write thread (§4.4.2) can `select`/`poll` across every mapped
/// region alongside its other file descriptors.
pub trait Umem: Send + Sync {
    /// Map `length` bytes of shared memory starting at `shmem_base`,
    /// registering it for userfault handling.
    fn map(&self, shmem_base: *mut u8, length: usize) -> Result<(), UmemError>;

    /// Unmap a previously-mapped region. Called once every block reports
    /// `finished` (spec §4.4.5).
    fn unmap(&self, shmem_base: *mut u8, length: usize) -> Result<(), UmemError>;

    /// Drain up to `max` pending fault offsets (host-page granularity,
    /// relative to the mapped region's base). Non-blocking; an empty batch
    /// means no fault is currently pending.
    fn pending_faults(&self, max: usize) -> Result<FaultBatch, UmemError>;

    /// Tell the kernel the pages at `offsets` (host-page granularity) are
    /// now resident and any faulting vCPU may be woken. Batched: called at
    /// most once per page over the session (spec invariant 5, §8 property
    /// 2).
    fn mark_page_cached(&self, offsets: &[u64]) -> Result<(), UmemError>;

    /// Release the userfault backing for a resident page, allowing the
    /// kernel to reclaim the bookkeeping once the fault-write round trip
    /// (§4.3) has confirmed the VMM observed it.
    fn remove_shmem(&self, offset: u64, len: usize) -> Result<(), UmemError>;

    /// A descriptor the daemon can multiplex on to learn when
    /// `pending_faults` would return non-empty.
    fn as_raw_fd(&self) -> RawFd;

    /// `true` once every page backed by this device has been marked cached
    /// and the fault-write round trip has completed for it.
    fn finished(&self) -> bool;
}
