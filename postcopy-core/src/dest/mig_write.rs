//! mig-write thread (spec §4.4.2): turn UMEM faults into outbound PAGE /
//! PAGE_CONT requests, and fast-ack pages already known present.

use log::{debug, error, info};
use postcopy_hal::pagesize::Granule;
use postcopy_hal::poll::{self, Interest};
use postcopy_hal::Umem;

use crate::codec::{encode_frame, encode_logical_request, Request};
use crate::dest::blockset::BlockSet;
use crate::dest::state::{DaemonState, StateFlags};

/// Largest number of raw fault offsets drained from UMEM in one pass
/// (§4.4.2: `512 * 65`).
pub const MAX_REQUESTS: usize = 512 * 65;

/// Run the mig-write loop until `state` reaches `END_MASK`. The 1-second
/// `select` timeout (§4.4.2) exists so this thread notices `EOC_SEND_REQ`
/// and sends the `EOC` command even when no UMEM descriptor is ready.
pub fn run(
    umem_devices: &[&dyn Umem],
    blocks: &BlockSet,
    writer: &mut impl std::io::Write,
    state: &DaemonState,
    host_page_size: u64,
) {
    loop {
        if state.is_end() {
            info!("mig-write: exiting, END_MASK reached");
            return;
        }

        if send_eoc_if_requested(writer, state) {
            continue;
        }

        let interests: Vec<Interest> = umem_devices.iter().map(|u| Interest::readable(u.as_raw_fd())).collect();
        let readiness = match poll::wait(&interests, Some(std::time::Duration::from_secs(1))) {
            Ok(r) => r,
            Err(_) => continue, // EINTR or transient error: retry
        };

        for (dev, ready) in umem_devices.iter().zip(readiness.iter()) {
            if !ready.readable {
                continue;
            }
            let faults = match dev.pending_faults(MAX_REQUESTS) {
                Ok(f) => f,
                Err(e) => {
                    error!("mig-write: pending_faults failed: {e}");
                    state.set(StateFlags::ERROR_REQ);
                    return;
                }
            };
            if faults.is_empty() {
                continue;
            }
            if let Err(e) = handle_faults(*dev, blocks, writer, &faults, host_page_size) {
                error!("mig-write: {e}");
                state.set(StateFlags::ERROR_REQ);
                return;
            }
        }
    }
}

/// §4.4.2/§4.5: once `fault_thread` or `mig_read` requests an `EOC` send,
/// this is the only thread that owns the request-stream writer, so it is
/// the one that actually transmits the command and flips
/// `EOC_SENDING`/`EOC_SENT`. Returns `true` if it just handled a send (the
/// caller should re-check `state` before blocking in `poll` again).
fn send_eoc_if_requested(writer: &mut impl std::io::Write, state: &DaemonState) -> bool {
    let bits = state.snapshot();
    if !bits.contains(StateFlags::EOC_SEND_REQ) || bits.contains(StateFlags::EOC_SENDING) {
        return false;
    }
    state.set(StateFlags::EOC_SENDING);
    let mut buf = Vec::new();
    encode_frame(&mut buf, &Request::Eoc);
    match writer.write_all(&buf) {
        Ok(()) => {
            info!("mig-write: EOC sent");
            state.set(StateFlags::EOC_SENT);
        }
        Err(e) => {
            error!("mig-write: failed to send EOC: {e}");
            state.set(StateFlags::ERROR_REQ);
        }
    }
    true
}

struct OutboundRequest {
    block_id: String,
    offsets: Vec<u64>,
}

/// Process one batch of raw host-page fault offsets for a single UMEM
/// device, classifying each as "already present" (fast ack) or "needs
/// request" (§4.4.2).
fn handle_faults(
    umem: &dyn Umem,
    blocks: &BlockSet,
    writer: &mut impl std::io::Write,
    faults: &[u64],
    host_page_size: u64,
) -> Result<(), String> {
    let mut page_clean: Vec<u64> = Vec::new();
    // Contiguous runs against the same block become one logical request
    // (PAGE + PAGE_CONT*); a block change always starts a fresh PAGE, which
    // is exactly the "PAGE if the block changed since the last request,
    // else PAGE_CONT" rule in §4.4.2.
    let mut requests: Vec<OutboundRequest> = Vec::new();

    for &abs_host_offset in faults {
        let Some((block, local_host_idx)) = blocks.find_by_abs_host_offset(abs_host_offset, host_page_size) else {
            debug!("mig-write: fault offset {abs_host_offset} maps to no known block, dropping");
            continue;
        };

        let mut push_tp = |tp: u64| match requests.last_mut() {
            Some(req) if req.block_id == block.id => req.offsets.push(tp),
            _ => requests.push(OutboundRequest { block_id: block.id.clone(), offsets: vec![tp] }),
        };

        match block.geometry.granule() {
            Granule::TargetCoarser { ratio } => {
                let tp = local_host_idx / ratio.max(1);
                if block.is_known_present(tp) {
                    page_clean.push(abs_host_offset);
                } else if !block.phys_requested.test_and_set(tp) {
                    push_tp(tp);
                }
            }
            Granule::HostCoarser { .. } => {
                let covering = block.geometry.target_offsets_of_host_index(local_host_idx);
                if covering.iter().all(|&tp| block.is_known_present(tp)) {
                    page_clean.push(abs_host_offset);
                } else {
                    for &tp in &covering {
                        if !block.phys_requested.test_and_set(tp) {
                            push_tp(tp);
                        }
                    }
                }
            }
        }
    }

    for req in &requests {
        flush_request(writer, req).map_err(|e| e.to_string())?;
    }

    if !page_clean.is_empty() {
        umem.mark_page_cached(&page_clean).map_err(|e| e.to_string())?;
    }

    Ok(())
}

fn flush_request(writer: &mut impl std::io::Write, req: &OutboundRequest) -> std::io::Result<()> {
    let mut buf = Vec::new();
    encode_logical_request(&mut buf, &req.block_id, &req.offsets);
    writer.write_all(&buf)
}
