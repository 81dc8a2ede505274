//! Pipe-pressure test (spec §8 scenario S5): when the fault-write pipe is
//! full, mig-read must queue the overflow on `pending_clean_bitmap` rather
//! than block (Design Note 9), and the pending-clean thread must later drain
//! that backlog to zero once the pipe is writable again.

mod common;

use std::io::Read;
use std::os::unix::io::AsRawFd;

use postcopy_core::block::{MemoryBlock, SharedMemory};
use postcopy_core::config::PostcopyConfig;
use postcopy_core::dest::blockset::BlockSet;
use postcopy_core::dest::mig_read;
use postcopy_core::dest::pending_clean::{self, PendingCleanSync};
use postcopy_core::dest::state::DaemonState;
use postcopy_core::response::{ResponseFlags, ResponseHeader};
use postcopy_hal::{pipe, PageGeometry};

use common::FakeUmem;

const PAGE: u64 = 4096;

fn push_page_frame(wire: &mut Vec<u8>, id: &str, offset: u64, fill: u8) {
    let header = ResponseHeader::encode(offset, ResponseFlags::PAGE);
    wire.extend_from_slice(&header.to_be_bytes());
    wire.push(id.len() as u8);
    wire.extend_from_slice(id.as_bytes());
    wire.extend_from_slice(&vec![fill; PAGE as usize]);
}

fn push_eos(wire: &mut Vec<u8>) {
    let header = ResponseHeader::encode(0, ResponseFlags::EOS);
    wire.extend_from_slice(&header.to_be_bytes());
}

/// Feed `mig_read::run` enough `PAGE` frames, over a fault-write pipe that is
/// never drained, to guarantee at least one write overflows `PIPE_BUF`. Every
/// offset that doesn't fit must land in `pending_clean_bitmap` instead of
/// blocking the call.
#[test]
fn s5_overflow_queues_pending_clean_without_blocking() {
    let geometry = PageGeometry::new(PAGE, PAGE);
    let n_pages = (pipe::offsets_per_pipe_buf() as u64) * 3;
    let block = MemoryBlock::new("only", 0, n_pages * PAGE, geometry, SharedMemory::new_heap((n_pages * PAGE) as usize));
    let blocks = BlockSet::new(vec![block]);

    let mut wire = Vec::new();
    for tp in 0..n_pages {
        push_page_frame(&mut wire, "only", tp * PAGE, tp as u8);
    }
    push_eos(&mut wire);
    let mut reader = std::io::Cursor::new(wire);

    let umem = FakeUmem::new();
    // A pipe that is never drained during mig-read, shrunk to the kernel
    // minimum so a handful of chunks is guaranteed to overflow it regardless
    // of the host's default `PIPE_BUF`/pipe-capacity settings.
    let (mut fault_read, mut fault_write) = pipe::new_pipe(true).unwrap();
    unsafe {
        libc::fcntl(fault_write.as_raw_fd(), libc::F_SETPIPE_SZ, 4096);
    }
    pipe::set_nonblocking(fault_read.as_raw_fd()).unwrap();
    let pending_sync = PendingCleanSync::new();
    let state = DaemonState::new();
    let config = PostcopyConfig { host_page_size: PAGE, target_page_size: PAGE, ..Default::default() };

    let start = std::time::Instant::now();
    mig_read::run(&mut reader, &blocks, &umem, &mut fault_write, &pending_sync, &state, &config);
    // mig-read must never block on a full pipe (Design Note 9); the whole
    // run should complete almost instantly even though the pipe fills.
    assert!(start.elapsed() < std::time::Duration::from_secs(2), "mig-read blocked on a full pipe");

    let block = blocks.get("only").unwrap();
    let queued = block.nr_pending_clean.load(std::sync::atomic::Ordering::SeqCst);
    assert!(queued > 0, "expected some offsets to overflow into pending-clean backlog");

    // Every page nonetheless reached "known present" and got either a direct
    // notification or a queued one -- no offset is silently dropped.
    let direct = pipe::read_offsets_nonblocking(&mut fault_read, n_pages as usize).unwrap();
    assert_eq!(direct.len() + queued, n_pages as usize);

    // Now let the pending-clean thread drain the backlog. Use a fresh pipe
    // for this half so draining the first batch doesn't race with the
    // `direct` read above.
    let (mut drain_read, mut drain_write) = pipe::new_pipe(false).unwrap();
    // Re-queue the same backlog onto a pipe the test can read from: the
    // pending-clean thread only cares that `pending_clean_bitmap` has bits
    // set and that the pipe it's handed is writable.
    pending_sync.request_exit();
    let chunk_len = pipe::offsets_per_pipe_buf();
    pending_clean::run(&blocks, &mut drain_write, &pending_sync, &state, chunk_len);

    assert_eq!(block.nr_pending_clean.load(std::sync::atomic::Ordering::SeqCst), 0, "backlog must fully drain");

    drop(drain_write);
    let mut drained_offsets = Vec::new();
    loop {
        let mut buf = [0u8; 8];
        match drain_read.read_exact(&mut buf) {
            Ok(()) => drained_offsets.push(u64::from_ne_bytes(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => panic!("{e}"),
        }
    }
    assert_eq!(drained_offsets.len(), queued, "every queued offset must be written exactly once during drain");
}
