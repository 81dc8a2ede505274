//! The `Channel` contract that both transport backends
//! (`postcopy-transport-socket`, `postcopy-transport-rdma`) satisfy
//! (SPEC_FULL §10.1).
//!
//! The engine never talks to a socket directly: every thread that needs to
//! read or write the duplex migration channel asks a `Channel` for an
//! independent, clonable reader or writer descriptor, mirroring how the
//! source scheduler (§4.2) duplicates its migration channel fd into a
//! dedicated `read_fd` and `write_fd`.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

/// A readable half of the duplex channel, pollable and independently
/// clonable from the writer half.
pub trait ChannelReader: Read + AsRawFd + Send {}
impl<T: Read + AsRawFd + Send> ChannelReader for T {}

/// A writable half of the duplex channel.
pub trait ChannelWriter: Write + AsRawFd + Send {}
impl<T: Write + AsRawFd + Send> ChannelWriter for T {}

/// A duplex, byte-stream migration channel. Transport backends hand out
/// independent fd-bearing handles so each daemon thread (and the source
/// scheduler's single `select` loop) can multiplex on its own descriptor
/// without contending on a shared lock.
pub trait Channel: Send + Sync {
    fn try_clone_reader(&self) -> std::io::Result<Box<dyn ChannelReader>>;
    fn try_clone_writer(&self) -> std::io::Result<Box<dyn ChannelWriter>>;
}
