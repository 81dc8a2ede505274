//! Destination fault ingestor (spec §4.3), owned by the main VMM process.
//!
//! For each host-page offset received on the inbound pipe, force-read one
//! byte at that offset (faulting it into this process's own page tables),
//! then echo the offset back on the outbound pipe so the daemon's fault
//! thread can release the waiting vCPU.

use std::io;

use log::{info, warn};
use nix::sys::signal::{self, SigHandler, Signal};

use postcopy_hal::pipe;

use crate::block::SharedMemory;

/// Mask `SIGPIPE` (§4.3) so a write to a closed outbound pipe returns
/// `EPIPE` instead of terminating the process.
pub fn mask_sigpipe() {
    unsafe {
        // SAFETY: installing SIG_IGN for SIGPIPE is the standard,
        // signal-safe way to make writes to closed pipes return EPIPE.
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Run the ingestor loop. `shmem` maps the same guest-RAM region the daemon
/// writes into; `base_host_offset` converts the pipe's absolute host-page
/// offsets into byte offsets within `shmem`.
pub fn run(
    inbound: &mut impl io::Read,
    outbound: &mut (impl io::Write + std::os::unix::io::AsRawFd),
    shmem: &SharedMemory,
    host_page_size: u64,
) {
    mask_sigpipe();
    loop {
        let offset = match pipe::read_offset_blocking(inbound) {
            Ok(o) => o,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("ingestor: inbound pipe closed, exiting");
                return;
            }
            Err(e) => {
                warn!("ingestor: inbound read error: {e}, exiting");
                return;
            }
        };

        let byte_offset = offset * host_page_size;
        let _ = shmem.force_read_byte(byte_offset);

        if let Err(e) = pipe::write_offsets_blocking(outbound, &[offset]) {
            warn!("ingestor: outbound write error: {e}, exiting");
            return;
        }
    }
}
