//! mig-write geometry regression test (review fix): target=4096, host=16384
//! (`HostCoarser`, ratio 4), block two host pages wide. A fault on the
//! *second* host page must be requested as target offsets [4,5,6,7], not
//! [0,1,2,3] (which is what `target_offsets_of_host` would wrongly return
//! if handed a host-page index instead of a target-page index).

mod common;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use postcopy_core::block::{MemoryBlock, SharedMemory};
use postcopy_core::codec::{Decoder, Request};
use postcopy_core::dest::blockset::BlockSet;
use postcopy_core::dest::state::{DaemonState, StateFlags};
use postcopy_core::dest::mig_write;
use postcopy_hal::PageGeometry;

use common::FakeUmem;

const HOST_PAGE: u64 = 16384;
const TARGET_PAGE: u64 = 4096;

#[test]
fn fault_on_second_host_page_requests_its_own_target_offsets() {
    let geometry = PageGeometry::new(HOST_PAGE, TARGET_PAGE);
    let block = MemoryBlock::new("only", 0, HOST_PAGE * 2, geometry, SharedMemory::new_heap((HOST_PAGE * 2) as usize));
    let blocks = Arc::new(BlockSet::new(vec![block]));

    let umem = Arc::new(FakeUmem::new());
    umem.push_fault(1); // absolute host-page index 1: target pages [4,5,6,7]

    let (mut local, remote) = UnixStream::pair().unwrap();
    let mut writer = remote;
    local.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let state = Arc::new(DaemonState::new());

    let thread_blocks = blocks.clone();
    let thread_umem = umem.clone();
    let thread_state = state.clone();
    let handle = std::thread::spawn(move || {
        let devices: Vec<&dyn postcopy_hal::Umem> = vec![thread_umem.as_ref()];
        mig_write::run(&devices, &thread_blocks, &mut writer, &thread_state, HOST_PAGE);
    });

    let mut buf = [0u8; 256];
    let mut decoder = Decoder::new();
    let mut got = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while got.is_none() && std::time::Instant::now() < deadline {
        match local.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                if let Ok(Some(req)) = decoder.try_decode() {
                    got = Some(req);
                }
            }
            Err(_) => break,
        }
    }

    // mig_write::run only exits once state reaches END_MASK; satisfy it
    // directly so the thread joins rather than leaking past the test.
    state.set(StateFlags::EOS_RECEIVED);
    state.set(StateFlags::EOC_SEND_REQ);
    state.set(StateFlags::EOC_SENDING);
    state.set(StateFlags::EOC_SENT);
    state.set(StateFlags::QUIT_QUEUED);
    state.set(StateFlags::QUIT_SENDING);
    state.set(StateFlags::QUIT_SENT);

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("mig_write thread did not join after END_MASK was satisfied");

    match got.expect("mig-write must emit a request for the faulted host page") {
        Request::Page { id, offsets } => {
            assert_eq!(id, "only");
            assert_eq!(offsets, vec![4, 5, 6, 7], "must request the second host page's own target offsets, not the first host page's");
        }
        other => panic!("expected a Page request, got {other:?}"),
    }
}
