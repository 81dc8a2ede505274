//! `PIPE_BUF`-aware helpers for the inner control and notification pipes
//! (spec §4.3, §4.4.3, §4.4.4, §6).
//!
//! All offsets on these pipes are native-endian `u64` host-page offsets (or,
//! on the `to_qemu`/`from_qemu` control pipe, single bytes). Writes are kept
//! at or below `PIPE_BUF` so that concurrent writers never interleave a
//! partial record, and the non-blocking fault-write path never blocks the
//! mig-read thread (Design Note 9: "never a deadlock").

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;

/// Number of `u64` offsets that fit in one `PIPE_BUF`-sized write, leaving
/// room so the write is never exactly at the boundary.
pub fn offsets_per_pipe_buf() -> usize {
    (pipe_buf() / 8).saturating_sub(1).max(1)
}

/// The platform's `PIPE_BUF` guarantee (atomic write size for a pipe).
pub fn pipe_buf() -> usize {
    libc::PIPE_BUF
}

/// Create a pipe pair. `nonblock_write` marks the write end `O_NONBLOCK`,
/// matching the fault-write pipe's requirement that mig-read never blocks
/// on notification delivery.
pub fn new_pipe(nonblock_write: bool) -> io::Result<(std::fs::File, std::fs::File)> {
    let (read_fd, write_fd) = unistd::pipe().map_err(nix_to_io)?;
    if nonblock_write {
        set_nonblocking(write_fd)?;
    }
    use std::os::unix::io::FromRawFd;
    // SAFETY: both fds were just created by `pipe()` and are owned here.
    let read = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let write = unsafe { std::fs::File::from_raw_fd(write_fd) };
    Ok((read, write))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(nix_to_io)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(nix_to_io)?;
    Ok(())
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Write `offsets` to `w` in chunks no larger than one `PIPE_BUF`. Returns
/// `Ok(n)` with the number of offsets actually written before a would-block
/// or error; callers on the non-blocking fault-write path treat a partial
/// write as "the rest overflowed, route to pending-clean".
pub fn write_offsets_nonblocking(w: &mut impl Write, offsets: &[u64]) -> io::Result<usize> {
    let chunk_len = offsets_per_pipe_buf();
    let mut written = 0;
    for chunk in offsets.chunks(chunk_len) {
        let mut buf = Vec::with_capacity(chunk.len() * 8);
        for off in chunk {
            buf.extend_from_slice(&off.to_ne_bytes());
        }
        match w.write(&buf) {
            Ok(n) if n == buf.len() => written += chunk.len(),
            Ok(_) => return Ok(written), // short write, treat the rest as unwritten
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(written),
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Write `offsets` to `w`, blocking until all of them land. Used by the
/// pending-clean thread (§4.4.4), which deliberately blocks to drain
/// backlog once the pipe is known writable.
pub fn write_offsets_blocking(w: &mut impl Write, offsets: &[u64]) -> io::Result<()> {
    let chunk_len = offsets_per_pipe_buf();
    for chunk in offsets.chunks(chunk_len) {
        let mut buf = Vec::with_capacity(chunk.len() * 8);
        for off in chunk {
            buf.extend_from_slice(&off.to_ne_bytes());
        }
        w.write_all(&buf)?;
    }
    Ok(())
}

/// Read up to `max` native-endian `u64` offsets from `r`, non-blocking.
/// Returns an empty vector on `WouldBlock`.
pub fn read_offsets_nonblocking(r: &mut impl Read, max: usize) -> io::Result<Vec<u64>> {
    let mut buf = vec![0u8; max * 8];
    let n = match r.read(&mut buf) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
        Err(e) => return Err(e),
    };
    let whole = n / 8;
    Ok(buf[..whole * 8]
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

/// Read exactly one native-endian `u64` offset from `r`, blocking.
pub fn read_offset_blocking(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

pub fn raw_fd(f: &impl AsRawFd) -> RawFd {
    f.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_offsets_through_a_real_pipe() {
        let (mut read, mut write) = new_pipe(false).unwrap();
        let offsets: Vec<u64> = (0..10).collect();
        write_offsets_blocking(&mut write, &offsets).unwrap();
        drop(write);
        let mut got = Vec::new();
        loop {
            let mut buf = [0u8; 8];
            match read.read_exact(&mut buf) {
                Ok(()) => got.push(u64::from_ne_bytes(buf)),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(got, offsets);
    }

    #[test]
    fn nonblocking_read_on_empty_pipe_yields_no_offsets() {
        let (mut read, write) = new_pipe(true).unwrap();
        set_nonblocking(raw_fd(&read)).unwrap();
        let got = read_offsets_nonblocking(&mut read, 16).unwrap();
        assert!(got.is_empty());
        drop(write);
    }
}
