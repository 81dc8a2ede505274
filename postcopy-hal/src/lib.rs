//! Hardware/OS abstraction layer for the post-copy migration engine.
//!
//! This crate is the narrow boundary against collaborators the protocol and
//! concurrency engine in `postcopy-core` treats as out of scope: the
//! guest-memory userfault device ("UMEM"), page-geometry arithmetic between
//! the guest's target page size and the host's page size, and the OS
//! readiness/pipe primitives every daemon thread multiplexes on.

pub mod pagesize;
pub mod pipe;
pub mod poll;
pub mod uffd;
pub mod umem;

pub use pagesize::PageGeometry;
pub use uffd::UffdUmem;
pub use umem::{FaultBatch, Umem, UmemError};
