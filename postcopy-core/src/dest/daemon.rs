//! Destination daemon (umemd, spec §4.4): wires the five long-lived threads
//! plus the clean-bitmap hand-off initialization phase.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

use postcopy_hal::Umem;

use crate::block::MemoryBlock;
use crate::channel::{Channel, ChannelReader, ChannelWriter};
use crate::clean_bitmap;
use crate::config::PostcopyConfig;
use crate::dest::blockset::BlockSet;
use crate::dest::pending_clean::PendingCleanSync;
use crate::dest::state::DaemonState;
use crate::dest::{fault_thread, mig_read, mig_write, pending_clean, pipe_thread};
use crate::error::DaemonError;

/// Everything the daemon needs beyond the migration channel and UMEM
/// device: the VMM control pipe and the inner fault-notification pipes
/// (§4.3, §4.4.3, §4.4.4).
pub struct DaemonPipes {
    pub from_qemu: std::fs::File,
    pub to_qemu: std::fs::File,
    pub fault_write: std::fs::File,
    pub fault_read: std::fs::File,
}

/// A running daemon: join handles for the five threads plus the shared
/// state every thread converges on.
pub struct Daemon {
    pub state: Arc<DaemonState>,
    pending_sync: Arc<PendingCleanSync>,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Initialize blocks from a clean-bitmap hand-off stream (if pre-copy
    /// ran), then spawn the five daemon threads (§4.4.1-.5).
    pub fn start(
        channel: &dyn Channel,
        mut blocks: Vec<MemoryBlock>,
        umem: Arc<dyn Umem>,
        pipes: DaemonPipes,
        config: PostcopyConfig,
        precopy_ran: bool,
    ) -> Result<Self, DaemonError> {
        if precopy_ran {
            let mut control = ReadHalf(channel.try_clone_reader()?);
            load_clean_bitmaps(&mut control, &mut blocks)?;
        }

        let blocks = Arc::new(BlockSet::new(blocks));
        let state = Arc::new(DaemonState::new());
        let pending_sync = Arc::new(PendingCleanSync::new());

        let host_page_size = config.host_page_size;

        let mut handles = Vec::new();

        // mig-read: owns the response-stream reader.
        {
            let mut reader = ReadHalf(channel.try_clone_reader()?);
            let blocks = blocks.clone();
            let umem = umem.clone();
            let mut fault_write = pipes.fault_write.try_clone()?;
            let pending_sync = pending_sync.clone();
            let state = state.clone();
            let config = config.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("mig-read".into())
                    .spawn(move || {
                        mig_read::run(&mut reader, &blocks, umem.as_ref(), &mut fault_write, &pending_sync, &state, &config);
                    })
                    .expect("spawn mig-read"),
            );
        }

        // mig-write: owns the request-stream writer.
        {
            let mut writer = WriteHalf(channel.try_clone_writer()?);
            let blocks = blocks.clone();
            let umem = umem.clone();
            let state = state.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("mig-write".into())
                    .spawn(move || {
                        mig_write::run(&[umem.as_ref()], &blocks, &mut writer, &state, host_page_size);
                    })
                    .expect("spawn mig-write"),
            );
        }

        // pipe: VMM control byte exchange.
        {
            let mut from_qemu = pipes.from_qemu.try_clone()?;
            let mut to_qemu = pipes.to_qemu.try_clone()?;
            let state = state.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("pipe".into())
                    .spawn(move || {
                        pipe_thread::run(&mut from_qemu, &mut to_qemu, &state);
                    })
                    .expect("spawn pipe"),
            );
        }

        // fault: releases UMEM backing once the VMM confirms a page landed.
        {
            let mut fault_read = pipes.fault_read.try_clone()?;
            let blocks = blocks.clone();
            let umem = umem.clone();
            let state = state.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("fault".into())
                    .spawn(move || {
                        fault_thread::run(&mut fault_read, &blocks, umem.as_ref(), &state, host_page_size);
                    })
                    .expect("spawn fault"),
            );
        }

        // pending-clean: drains fault-write overflow.
        {
            let mut fault_write = pipes.fault_write.try_clone()?;
            let blocks = blocks.clone();
            let pending_sync = pending_sync.clone();
            let state = state.clone();
            let chunk_len = postcopy_hal::pipe::offsets_per_pipe_buf();
            handles.push(
                std::thread::Builder::new()
                    .name("pending-clean".into())
                    .spawn(move || {
                        pending_clean::run(&blocks, &mut fault_write, &pending_sync, &state, chunk_len);
                    })
                    .expect("spawn pending-clean"),
            );
        }

        // Clean-bitmap pages are already "present": kick the pending-clean
        // drain so mark_page_cached/fault-write notifications go out before
        // normal post-copy traffic starts (§4.6).
        if precopy_ran {
            let mut total = 0usize;
            for b in blocks.values() {
                total += b.nr_pending_clean.load(std::sync::atomic::Ordering::SeqCst);
            }
            pending_sync.add(total);
        }

        info!("umemd: all five threads started");
        Ok(Self { state, pending_sync, handles })
    }

    /// Block until `state` converges on `END_MASK`, then join every thread.
    ///
    /// The pending-clean thread only wakes on its own condvar (new backlog,
    /// or an explicit exit request): a session that never overflows the
    /// fault-write pipe would otherwise leave it blocked forever, so once
    /// every other thread has converged this nudges it to check `state` and
    /// exit once its own backlog has drained to zero.
    pub fn wait(self) {
        self.state.wait_for_end(Duration::from_secs(3600));
        self.pending_sync.request_exit();
        for h in self.handles {
            let _ = h.join();
        }
    }
}

/// Adapts a boxed [`ChannelReader`]/[`ChannelWriter`] trait object into a
/// concrete `Read`/`Write` impl, since the generic daemon-thread functions
/// take `impl Read`/`impl Write` rather than the narrower `Channel` traits.
struct ReadHalf(Box<dyn ChannelReader>);
impl io::Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

struct WriteHalf(Box<dyn ChannelWriter>);
impl io::Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn load_clean_bitmaps(control: &mut (impl io::Read + Send), blocks: &mut [MemoryBlock]) -> Result<(), DaemonError> {
    while let Some(record) = clean_bitmap::read_record(control)? {
        if let Some(block) = blocks.iter_mut().find(|b| b.id == record.id) {
            let target_pages = block.target_pages();
            let bm = clean_bitmap::bitmap_from_record(&record, target_pages);
            block.install_clean_bitmap(bm);
        }
    }
    Ok(())
}
