//! Orderly-shutdown test (spec §8 scenario S6): a full `Daemon` driven by a
//! response-stream `EOS` plus a VMM-initiated `QEMU_QUIT`, checked for
//! convergence through the `EOC`/`QUIT` sequences onto `END_MASK` and for a
//! clean join of all five threads.

mod common;

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use postcopy_core::block::{MemoryBlock, SharedMemory};
use postcopy_core::config::PostcopyConfig;
use postcopy_core::dest::daemon::{Daemon, DaemonPipes};
use postcopy_core::dest::pipe_thread::QEMU_QUIT;
use postcopy_core::dest::StateFlags;
use postcopy_core::response::{ResponseFlags, ResponseHeader};
use postcopy_hal::poll::{self, Interest};
use postcopy_hal::{pipe, PageGeometry};
use postcopy_transport_socket::SocketChannel;

use common::{wait_until, FakeUmem};

const PAGE: u64 = 4096;

#[test]
fn s6_eos_and_qemu_quit_converge_on_end_mask_and_threads_join() {
    let (daemon_sock, mut source_stub) = UnixStream::pair().unwrap();
    let channel = SocketChannel::Unix(daemon_sock);

    // vmm <-> daemon control pipes.
    let (daemon_from_qemu, mut test_to_daemon) = pipe::new_pipe(false).unwrap();
    let (mut test_from_daemon, daemon_to_qemu) = pipe::new_pipe(false).unwrap();

    // Fault-write (notify) pipe: kept open on the test side so mig-read's
    // non-blocking write never hits a reader-less pipe (SIGPIPE risk); never
    // drained in this test since nothing overflows a single notification.
    let (_fault_notify_peer, daemon_fault_write) = pipe::new_pipe(true).unwrap();

    // Fault-read (ack) pipe: the peer write end is dropped immediately, so
    // the fault thread observes EOF right away -- there is no real ingestor
    // in this test and no fault ever occurs, so it has nothing to wait for.
    let (daemon_fault_read, fault_ack_write) = pipe::new_pipe(false).unwrap();
    drop(fault_ack_write);

    let pipes = DaemonPipes {
        from_qemu: daemon_from_qemu,
        to_qemu: daemon_to_qemu,
        fault_write: daemon_fault_write,
        fault_read: daemon_fault_read,
    };

    let geometry = PageGeometry::new(PAGE, PAGE);
    let block = MemoryBlock::new("m0", 0, PAGE, geometry, SharedMemory::new_heap(PAGE as usize));

    let umem: Arc<dyn postcopy_hal::Umem> = Arc::new(FakeUmem::new());
    let config = PostcopyConfig { host_page_size: PAGE, target_page_size: PAGE, ..Default::default() };

    let daemon = Daemon::start(&channel, vec![block], umem, pipes, config, false).expect("daemon starts");
    let state = daemon.state.clone();

    // One real page, then EOS: mig-read will request EOC and exit.
    let mut wire = Vec::new();
    let header = ResponseHeader::encode(0, ResponseFlags::PAGE);
    wire.extend_from_slice(&header.to_be_bytes());
    wire.push(2); // id length
    wire.extend_from_slice(b"m0");
    wire.extend_from_slice(&vec![0x7Au8; PAGE as usize]);
    let eos = ResponseHeader::encode(0, ResponseFlags::EOS);
    wire.extend_from_slice(&eos.to_be_bytes());
    source_stub.write_all(&wire).unwrap();

    // The VMM main loop requests quit.
    test_to_daemon.write_all(&[QEMU_QUIT]).unwrap();

    assert!(
        wait_until(|| state.is_end(), Duration::from_secs(5)),
        "daemon state did not converge on END_MASK"
    );
    assert!(state.contains(StateFlags::EOS_RECEIVED));
    assert!(state.contains(StateFlags::EOC_SENT));
    assert!(state.contains(StateFlags::QUIT_RECEIVED));
    assert!(state.contains(StateFlags::QUIT_SENT));

    // The pipe thread must have echoed DAEMON_QUIT back to the VMM side.
    let readiness = poll::wait(&[Interest::readable(test_from_daemon.as_raw_fd())], Some(Duration::from_secs(2))).unwrap();
    assert!(readiness[0].readable, "expected DAEMON_QUIT on the to_qemu pipe");
    let mut byte = [0u8; 1];
    test_from_daemon.read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], postcopy_core::dest::pipe_thread::DAEMON_QUIT);

    // All five threads must join within a bounded time; run the blocking
    // join on another thread so a regression here fails the test instead of
    // hanging the whole suite.
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        daemon.wait();
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(10)).expect("daemon.wait() did not complete -- a thread failed to join");
}
