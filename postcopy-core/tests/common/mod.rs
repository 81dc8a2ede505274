//! Shared test fakes for the `postcopy-core` integration suite (spec §8
//! scenarios S1-S6). Not a test binary itself; each test file does
//! `mod common;` to pull these in.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use postcopy_hal::{FaultBatch, Umem, UmemError};

/// An in-memory UMEM stand-in. Faults are pushed by the test (simulating
/// guest page faults) and drained by `pending_faults`; every
/// `mark_page_cached`/`remove_shmem` call is recorded so tests can assert
/// the exactly-once invariant (spec §8 property 2) and inspect shutdown
/// ordering.
///
/// Fault availability is mirrored onto a real pipe so `as_raw_fd()` is
/// genuinely pollable: `mig-write`'s `select` loop (§4.4.2) needs a
/// descriptor that becomes readable exactly when the queue is non-empty.
pub struct FakeUmem {
    queue: Mutex<VecDeque<u64>>,
    signal_r: Mutex<File>,
    signal_w: Mutex<File>,
    pub cached: Mutex<Vec<u64>>,
    pub removed: Mutex<Vec<(u64, usize)>>,
    finished: AtomicBool,
}

impl FakeUmem {
    pub fn new() -> Self {
        let (r, w) = postcopy_hal::pipe::new_pipe(true).expect("pipe");
        postcopy_hal::pipe::set_nonblocking(r.as_raw_fd()).expect("nonblock read end");
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal_r: Mutex::new(r),
            signal_w: Mutex::new(w),
            cached: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// Push one fault offset (host-page granularity, absolute), as if a
    /// guest vCPU just touched an absent page.
    pub fn push_fault(&self, offset: u64) {
        self.queue.lock().unwrap().push_back(offset);
        let _ = self.signal_w.lock().unwrap().write_all(&[0u8]);
    }

    pub fn set_finished(&self, v: bool) {
        self.finished.store(v, Ordering::SeqCst);
    }
}

impl Default for FakeUmem {
    fn default() -> Self {
        Self::new()
    }
}

impl Umem for FakeUmem {
    fn map(&self, _shmem_base: *mut u8, _length: usize) -> Result<(), UmemError> {
        Ok(())
    }

    fn unmap(&self, _shmem_base: *mut u8, _length: usize) -> Result<(), UmemError> {
        Ok(())
    }

    fn pending_faults(&self, max: usize) -> Result<FaultBatch, UmemError> {
        let mut q = self.queue.lock().unwrap();
        let n = max.min(q.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(q.pop_front().unwrap());
        }
        if n > 0 {
            let mut drain = vec![0u8; n];
            let _ = self.signal_r.lock().unwrap().read(&mut drain);
        }
        Ok(out)
    }

    fn mark_page_cached(&self, offsets: &[u64]) -> Result<(), UmemError> {
        self.cached.lock().unwrap().extend_from_slice(offsets);
        Ok(())
    }

    fn remove_shmem(&self, offset: u64, len: usize) -> Result<(), UmemError> {
        self.removed.lock().unwrap().push((offset, len));
        Ok(())
    }

    fn as_raw_fd(&self) -> RawFd {
        self.signal_r.lock().unwrap().as_raw_fd()
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Block until `cond` is true or `timeout` elapses, polling every 2ms.
/// Used only to wait for cross-thread side effects (recorded UMEM calls,
/// bitmap state) that have no condvar of their own in the test harness.
pub fn wait_until(mut cond: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let start = std::time::Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    true
}
