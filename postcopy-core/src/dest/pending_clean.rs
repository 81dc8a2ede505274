//! Pending-clean thread (spec §4.4.4): drains `pending_clean_bitmap` once
//! the fault-write pipe, found full by mig-read, becomes writable again.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use postcopy_hal::pipe;
use postcopy_hal::poll::{self, Interest};

use crate::dest::blockset::BlockSet;
use crate::dest::state::{DaemonState, StateFlags};

/// Condvar-gated counter of outstanding pending-clean notifications across
/// every block, plus an exit request. Separate from the per-block
/// `nr_pending_clean` atomics (spec §3): those are the data, this is the
/// wake signal.
#[derive(Debug, Default)]
pub struct PendingCleanSync {
    inner: Mutex<Counters>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    exit: bool,
}

impl PendingCleanSync {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Counters::default()), cv: Condvar::new() }
    }

    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut g = self.inner.lock().unwrap();
        g.total += n;
        self.cv.notify_all();
    }

    fn sub(&self, n: usize) {
        let mut g = self.inner.lock().unwrap();
        g.total = g.total.saturating_sub(n);
    }

    pub fn request_exit(&self) {
        let mut g = self.inner.lock().unwrap();
        g.exit = true;
        self.cv.notify_all();
    }

    /// Block until there is backlog to drain or exit was requested with an
    /// empty backlog. Returns `false` only in the latter case (the thread's
    /// exit condition).
    pub fn wait_for_work(&self) -> bool {
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.total > 0 {
                return true;
            }
            if g.exit {
                return false;
            }
            g = self.cv.wait(g).unwrap();
        }
    }

    #[cfg(test)]
    pub fn total(&self) -> usize {
        self.inner.lock().unwrap().total
    }
}

/// The pending-clean thread body (spec §4.4.4).
pub fn run(
    blocks: &BlockSet,
    fault_write: &mut (impl Write + AsRawFd),
    sync: &PendingCleanSync,
    state: &DaemonState,
    chunk_len: usize,
) {
    loop {
        if !sync.wait_for_work() {
            return;
        }

        // Wait for the pipe to be writable, then batch arrivals for 1s.
        let _ = poll::wait(&[Interest::writable(fault_write.as_raw_fd())], None);
        std::thread::sleep(Duration::from_secs(1));

        let mut drained_total = 0usize;
        for block in blocks.values() {
            let mut batch = Vec::with_capacity(chunk_len);
            let mut drained_here = 0usize;
            for off in block.pending_clean_bitmap.iter_set() {
                batch.push(off);
                if batch.len() >= chunk_len {
                    if pipe::write_offsets_blocking(fault_write, &batch).is_err() {
                        state.set(StateFlags::ERROR_REQ);
                        return;
                    }
                    for &o in &batch {
                        block.pending_clean_bitmap.clear(o);
                    }
                    drained_here += batch.len();
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                if pipe::write_offsets_blocking(fault_write, &batch).is_err() {
                    state.set(StateFlags::ERROR_REQ);
                    return;
                }
                for &o in &batch {
                    block.pending_clean_bitmap.clear(o);
                }
                drained_here += batch.len();
            }
            block.nr_pending_clean.fetch_sub(drained_here, Ordering::SeqCst);
            drained_total += drained_here;
        }
        sync.sub(drained_total);

        if state.is_end() && sync.inner.lock().unwrap().total == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_work_returns_false_on_exit_with_empty_backlog() {
        let sync = PendingCleanSync::new();
        sync.request_exit();
        assert!(!sync.wait_for_work());
    }

    #[test]
    fn wait_for_work_returns_true_once_work_is_added() {
        let sync = PendingCleanSync::new();
        sync.add(3);
        assert!(sync.wait_for_work());
        assert_eq!(sync.total(), 3);
    }
}
