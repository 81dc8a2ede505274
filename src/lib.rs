//! Post-copy live-migration coordination engine: public facade.
//!
//! This crate aggregates the workspace's sub-crates behind one surface, the
//! same way the teacher's root crate re-exports its `arch`/`mm`/`time`
//! modules rather than making callers depend on them individually. The
//! actual engine lives in `postcopy-core` (wire codec, bitmaps, source
//! engine, destination daemon) and `postcopy-hal` (page geometry, UMEM,
//! pipe/poll primitives); this crate adds nothing but the default transport
//! wiring and re-exports.

pub use postcopy_core::{
    bitmap, block, channel, clean_bitmap, codec, config, dest, error, response, source,
    AtomicBitmap, Channel, ChannelReader, ChannelWriter, CodecError, Command, DaemonError,
    Decoder, MemoryBlock, Payload, PostcopyConfig, Request, ResponseFlags, ResponseHeader,
    SessionError, SharedMemory, MAX_ID_LEN, MAX_PAGE_NR,
};

pub use postcopy_hal::{pagesize, pipe, poll, uffd, umem, PageGeometry, Umem, UmemError};

pub use postcopy_transport_socket::{SocketChannel, SocketListener, TransportError};

#[cfg(feature = "rdma")]
pub use postcopy_transport_rdma::{RdmaChannel, RdmaConfig, RdmaError, RdmaListener};
