//! Thin `poll(2)` wrapper used by every select-driven loop in the engine:
//! the source scheduler (§4.2), mig-write (§4.4.2), the pipe thread
//! (§4.4.3), and the pending-clean thread's writability wait (§4.4.4).
//!
//! `EINTR` is treated as a spurious wake and retried transparently (Design
//! Note 9) so call sites never need to special-case it.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

/// Readiness observed for one descriptor after a `wait` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// One descriptor plus the readiness the caller wants to learn about.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn readable(fd: RawFd) -> Self {
        Self { fd, read: true, write: false }
    }

    pub fn writable(fd: RawFd) -> Self {
        Self { fd, read: false, write: true }
    }
}

/// Block until any of `interests` is ready or `timeout` elapses (`None` =
/// forever). Returns one `Readiness` per interest, in the same order.
/// `EINTR` retries with the remaining timeout rather than returning early.
pub fn wait(interests: &[Interest], timeout: Option<Duration>) -> nix::Result<Vec<Readiness>> {
    let mut fds: Vec<PollFd> = interests
        .iter()
        .map(|i| {
            let mut flags = PollFlags::empty();
            if i.read {
                flags.insert(PollFlags::POLLIN);
            }
            if i.write {
                flags.insert(PollFlags::POLLOUT);
            }
            PollFd::new(i.fd, flags)
        })
        .collect();

    let deadline = timeout.map(|d| std::time::Instant::now() + d);

    loop {
        let remaining_ms = match deadline {
            Some(d) => {
                let now = std::time::Instant::now();
                if now >= d {
                    0
                } else {
                    (d - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
            None => -1,
        };

        match poll(&mut fds, remaining_ms) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(fds
        .iter()
        .map(|pfd| {
            let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
            Readiness {
                readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
                writable: revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR),
            }
        })
        .collect())
}

/// Convenience: block (no timeout) until `fd` is writable.
pub fn wait_writable(fd: RawFd) -> nix::Result<()> {
    wait(&[Interest::writable(fd)], None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pipe_write_end_is_immediately_writable() {
        let (read, mut write) = crate::pipe::new_pipe(false).unwrap();
        use std::os::unix::io::AsRawFd;
        let ready = wait(&[Interest::writable(write.as_raw_fd())], Some(Duration::from_millis(100))).unwrap();
        assert!(ready[0].writable);
        write.write_all(b"x").unwrap();
        drop(read);
    }

    #[test]
    fn empty_pipe_read_end_times_out() {
        let (read, write) = crate::pipe::new_pipe(false).unwrap();
        use std::os::unix::io::AsRawFd;
        let ready = wait(&[Interest::readable(read.as_raw_fd())], Some(Duration::from_millis(50))).unwrap();
        assert!(!ready[0].readable);
        drop(write);
    }
}
