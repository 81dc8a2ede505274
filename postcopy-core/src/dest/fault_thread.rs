//! fault thread (spec §4.4.5): consume page-completion acks echoed back by
//! the VMM ingestor and release the corresponding UMEM backing.

use log::{error, info};

use postcopy_hal::pipe;
use postcopy_hal::Umem;

use crate::dest::blockset::BlockSet;
use crate::dest::state::{DaemonState, StateFlags};

/// Run the fault thread until the fault-read pipe closes or every block
/// reports finished, at which point shutdown is kicked off (§4.4.5).
pub fn run(fault_read: &mut impl std::io::Read, blocks: &BlockSet, umem: &dyn Umem, state: &DaemonState, host_page_size: u64) {
    loop {
        let offset = match pipe::read_offset_blocking(fault_read) {
            Ok(o) => o,
            Err(e) => {
                info!("fault: fault-read pipe closed ({e}), exiting");
                return;
            }
        };

        let Some((block, _local_host_idx)) = blocks.find_by_abs_host_offset(offset, host_page_size) else {
            error!("fault: ack for offset {offset} maps to no known block");
            continue;
        };

        // `offset` is already an absolute host-page index into the combined
        // guest-RAM mapping (the same basis the ingestor echoes and
        // `find_by_abs_host_offset` expects), and the production `Umem` is
        // mapped over that whole region, so `remove_shmem` needs the
        // absolute byte offset here, not a block-local one.
        let abs_byte_offset = offset * host_page_size;
        if let Err(e) = umem.remove_shmem(abs_byte_offset, host_page_size as usize) {
            error!("fault: remove_shmem failed: {e}");
            state.set(StateFlags::ERROR_REQ);
            return;
        }

        if block.release_host_pages(1) && blocks.all_finished() {
            info!("fault: all blocks finished, beginning shutdown");
            state.set(StateFlags::EOC_SEND_REQ);
            state.set(StateFlags::QUIT_QUEUED);
            return;
        }
    }
}
