//! mig-read thread (spec §4.4.1): receive page payloads from the source,
//! write them into shared memory, and tell UMEM the page is cached.

use std::io::{self, Read};
use std::sync::atomic::Ordering;

use log::{debug, error, info, warn};
use postcopy_hal::pagesize::Granule;
use postcopy_hal::pipe;
use postcopy_hal::{Umem, UmemError};

use crate::block::MemoryBlock;
use crate::codec::MAX_ID_LEN;
use crate::config::PostcopyConfig;
use crate::dest::blockset::BlockSet;
use crate::dest::pending_clean::PendingCleanSync;
use crate::dest::state::{DaemonState, StateFlags};
use crate::error::{CodecError, DaemonError};
use crate::response::{decode_payload, Payload, ResponseFlags, ResponseHeader};

/// Run the mig-read loop until `EOS` or an unrecoverable error. `reader` is
/// the upstream response-stream half of the migration channel.
pub fn run(
    reader: &mut impl Read,
    blocks: &BlockSet,
    umem: &dyn Umem,
    fault_write: &mut (impl std::io::Write + std::os::unix::io::AsRawFd),
    pending_sync: &PendingCleanSync,
    state: &DaemonState,
    config: &PostcopyConfig,
) {
    let mut last_block: Option<String> = None;

    loop {
        let header = match read_header(reader) {
            Ok(h) => h,
            Err(e) => {
                error!("mig-read: header read failed: {e}");
                state.set(StateFlags::ERROR_REQ);
                return;
            }
        };
        let decoded = ResponseHeader::decode(header);

        if decoded.flags.contains(ResponseFlags::EOS) {
            info!("mig-read: EOS received, requesting EOC send");
            state.set(StateFlags::EOC_SEND_REQ);
            state.set(StateFlags::EOS_RECEIVED);
            return;
        }

        if decoded.flags.contains(ResponseFlags::HOOK) {
            debug!("mig-read: HOOK flag observed, no-op");
            continue;
        }

        if decoded.flags.contains(ResponseFlags::MEM_SIZE) {
            // §9 Open Question, resolved in DESIGN.md: MEM_SIZE mid-stream
            // is a protocol error, not silently accepted.
            error!("mig-read: MEM_SIZE observed outside the init section");
            let _: DaemonError = CodecError::MemSizeOutsideInit.into();
            state.set(StateFlags::ERROR_REQ);
            return;
        }

        let block_id = if decoded.flags.contains(ResponseFlags::CONTINUE) {
            match &last_block {
                Some(id) => id.clone(),
                None => {
                    error!("mig-read: CONTINUE flag with no prior block");
                    state.set(StateFlags::ERROR_REQ);
                    return;
                }
            }
        } else {
            match read_id(reader) {
                Ok(id) => id,
                Err(e) => {
                    error!("mig-read: block id read failed: {e}");
                    state.set(StateFlags::ERROR_REQ);
                    return;
                }
            }
        };
        last_block = Some(block_id.clone());

        let Some(block) = blocks.get(&block_id) else {
            error!("mig-read: unknown block {block_id:?}");
            state.set(StateFlags::ERROR_REQ);
            return;
        };

        let body_len = if decoded.flags.contains(ResponseFlags::COMPRESS) {
            1
        } else if decoded.flags.contains(ResponseFlags::PAGE) {
            config.target_page_size as usize
        } else {
            0
        };
        let mut body = vec![0u8; body_len];
        if let Err(e) = reader.read_exact(&mut body) {
            error!("mig-read: payload read failed: {e}");
            state.set(StateFlags::ERROR_REQ);
            return;
        }

        let payload = match decode_payload(decoded.flags, &body) {
            Ok(p) => p,
            Err(e) => {
                error!("mig-read: payload decode failed: {e}");
                state.set(StateFlags::ERROR_REQ);
                return;
            }
        };
        if let Payload::Raw(_) | Payload::Fill(_) = &payload {
            let bytes = payload.materialize(config.target_page_size as usize);
            block.shmem.write_at(decoded.offset, &bytes);
        }

        let tp = decoded.offset / config.target_page_size;
        if let Err(e) = ram_loaded(block, tp, umem, fault_write, pending_sync, config.host_page_size) {
            error!("mig-read: ram_loaded failed: {e}");
            state.set(StateFlags::ERROR_REQ);
            return;
        }
    }
}

fn read_header(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_id(reader: &mut impl Read) -> io::Result<String> {
    let mut len_byte = [0u8; 1];
    reader.read_exact(&mut len_byte)?;
    let len = len_byte[0] as usize;
    if len > MAX_ID_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "block id exceeds wire limit"));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// §4.4.1 `ram_loaded`: test-and-set the appropriate bit(s) and, once a
/// host page becomes fully present, mark it cached. `host_page_size` is
/// needed here (not just in `geometry`) because the fault-write pipe and
/// `Umem::mark_page_cached` both address host pages by their *absolute*
/// offset into the combined guest-RAM mapping (the same basis
/// `BlockSet::find_by_abs_host_offset` expects), while `PageGeometry` only
/// knows block-local host-page indices.
fn ram_loaded(
    block: &MemoryBlock,
    tp: u64,
    umem: &dyn Umem,
    fault_write: &mut (impl std::io::Write + std::os::unix::io::AsRawFd),
    pending_sync: &PendingCleanSync,
    host_page_size: u64,
) -> Result<(), UmemError> {
    let block_base = block.offset / host_page_size;
    match block.geometry.granule() {
        Granule::TargetCoarser { .. } => {
            if block.phys_received.test_and_set(tp) {
                return Ok(());
            }
            let abs_offsets: Vec<u64> = block.geometry.host_offsets_of_target(tp).into_iter().map(|l| block_base + l).collect();
            mark_cached(block, &abs_offsets, umem, fault_write, pending_sync)
        }
        Granule::HostCoarser { .. } => {
            if block.phys_received.test_and_set(tp) {
                return Ok(());
            }
            let covering = block.geometry.target_offsets_of_host(tp);
            if block.phys_received.all_set(&covering) {
                if let Some(host_idx) = block.geometry.host_index_of_target(tp) {
                    mark_cached(block, &[block_base + host_idx], umem, fault_write, pending_sync)?;
                }
            }
            Ok(())
        }
    }
}

/// Two-step "mark cached" (§4.4.1): tell UMEM unconditionally, then try the
/// non-blocking fault-write pipe; anything that doesn't fit is queued on
/// `pending_clean_bitmap` rather than blocking this thread.
fn mark_cached(
    block: &MemoryBlock,
    host_offsets: &[u64],
    umem: &dyn Umem,
    fault_write: &mut (impl std::io::Write + std::os::unix::io::AsRawFd),
    pending_sync: &PendingCleanSync,
) -> Result<(), UmemError> {
    if host_offsets.is_empty() {
        return Ok(());
    }
    umem.mark_page_cached(host_offsets)?;

    let written = pipe::write_offsets_nonblocking(fault_write, host_offsets).unwrap_or(0);
    if written < host_offsets.len() {
        let overflow = &host_offsets[written..];
        let mut newly_pending = 0usize;
        for &off in overflow {
            if !block.pending_clean_bitmap.test_and_set(off) {
                newly_pending += 1;
            }
        }
        if newly_pending > 0 {
            block.nr_pending_clean.fetch_add(newly_pending, Ordering::SeqCst);
            pending_sync.add(newly_pending);
            warn!("mig-read: fault-write pipe full, {newly_pending} offsets queued pending-clean");
        }
    }
    Ok(())
}
