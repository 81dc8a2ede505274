//! pipe thread (spec §4.4.3): control-byte exchange with the VMM main loop.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::info;
use postcopy_hal::poll::{self, Interest};

use crate::dest::state::{DaemonState, StateFlags};

pub const DAEMON_QUIT: u8 = 0;
pub const DAEMON_ERROR: u8 = 1;
pub const QEMU_QUIT: u8 = 2;

/// Run the pipe thread until `state` converges on `END_MASK`. `from_qemu`
/// is read non-blocking on a 1-second poll; `to_qemu` is written once per
/// newly-observed `ERROR_REQ`/`QUIT_QUEUED` transition.
pub fn run(from_qemu: &mut (impl Read + AsRawFd), to_qemu: &mut (impl Write + AsRawFd), state: &DaemonState) {
    loop {
        if state.is_end() {
            info!("pipe: exiting, END_MASK reached");
            return;
        }

        if let Ok(readiness) = poll::wait(&[Interest::readable(from_qemu.as_raw_fd())], Some(Duration::from_secs(1))) {
            if readiness[0].readable {
                let mut byte = [0u8; 1];
                match from_qemu.read(&mut byte) {
                    Ok(1) if byte[0] == QEMU_QUIT => {
                        info!("pipe: QEMU_QUIT received, initiating orderly shutdown");
                        state.set(StateFlags::QUIT_RECEIVED);
                        state.set(StateFlags::QUIT_HANDLED);
                        state.set(StateFlags::QUIT_QUEUED);
                    }
                    Ok(0) | Err(_) => {
                        info!("pipe: from_qemu closed or errored");
                        state.set(StateFlags::ERROR_REQ);
                    }
                    Ok(_) => {}
                }
            }
        }

        let bits = state.snapshot();
        if bits.contains(StateFlags::ERROR_REQ) && !bits.contains(StateFlags::ERROR_SENDING) {
            state.set(StateFlags::ERROR_SENDING);
            if to_qemu.write_all(&[DAEMON_ERROR]).is_ok() {
                state.set(StateFlags::ERROR_SENT);
            }
        }
        if bits.contains(StateFlags::QUIT_QUEUED) && !bits.contains(StateFlags::QUIT_SENDING) {
            state.set(StateFlags::QUIT_SENDING);
            if to_qemu.write_all(&[DAEMON_QUIT]).is_ok() {
                state.set(StateFlags::QUIT_SENT);
            }
        }
    }
}
