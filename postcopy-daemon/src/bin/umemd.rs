//! `umemd`: hosts the destination daemon (spec §4.4) against a migration
//! channel dialed toward a listening `srcd`.
//!
//! This process plays both halves spec §4.3/§4.4 split across: the "main
//! VMM process" that owns the guest-RAM mapping and services page faults
//! (the ingestor, §4.3), and the destination daemon's five threads (§4.4).
//! Design Note 9 requires that split to survive even without `fork`; here we
//! take the simplest faithful route and actually `fork()`, mapping the
//! shared guest-RAM region `MAP_SHARED` before the fork so both halves of
//! the split see the same physical pages, exactly as a forked QEMU would.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};

use postcopy_core::dest::{ingestor, Daemon, DaemonPipes};
use postcopy_core::{Channel, MemoryBlock, SharedMemory};
use postcopy_daemon::{init_logging, mmap_shared_file, DestBlockSpec, PageGeometryArgs};
use postcopy_hal::{pipe, UffdUmem, Umem};
use postcopy_transport_socket::SocketChannel;

#[derive(Debug, Parser)]
#[command(name = "umemd", about = "Post-copy destination daemon host")]
struct Cli {
    /// Migration channel address to dial, e.g. `tcp:192.0.2.1:4444`.
    #[arg(long)]
    connect: String,

    /// Backing file for the combined guest-RAM mapping every block is a
    /// slice of.
    #[arg(long)]
    guest_ram: String,

    /// Total length in bytes of the combined guest-RAM mapping.
    #[arg(long)]
    guest_ram_length: u64,

    /// One memory block, `id:offset:length` (offsets within `--guest-ram`);
    /// repeatable.
    #[arg(long = "block", value_name = "ID:OFFSET:LENGTH")]
    blocks: Vec<DestBlockSpec>,

    /// A pre-copy phase ran first; load the clean-bitmap hand-off stream
    /// before starting the five threads (spec §4.6).
    #[arg(long, default_value_t = false)]
    precopy: bool,

    #[command(flatten)]
    geometry: PageGeometryArgs,
}

fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    if cli.blocks.is_empty() {
        anyhow::bail!("at least one --block is required");
    }

    let config = cli.geometry.build_config();
    let geometry = config.geometry();

    info!("umemd: connecting to {}", cli.connect);
    let channel = SocketChannel::connect(&cli.connect).context("connecting migration channel")?;
    info!("umemd: migration channel connected");

    let guest_ram_base = mmap_shared_file(&cli.guest_ram, cli.guest_ram_length).context("mapping guest-RAM backing file")?;

    let mut blocks = Vec::with_capacity(cli.blocks.len());
    for spec in &cli.blocks {
        anyhow::ensure!(
            spec.offset + spec.length <= cli.guest_ram_length,
            "block {} ({}..{}) exceeds guest-ram-length {}",
            spec.id,
            spec.offset,
            spec.offset + spec.length,
            cli.guest_ram_length
        );
        // SAFETY: `guest_ram_base` maps `cli.guest_ram_length` bytes; this
        // block's extent was just checked to lie within it.
        let shmem = unsafe { SharedMemory::from_raw(guest_ram_base.add(spec.offset as usize), spec.length as usize) };
        blocks.push(MemoryBlock::new(spec.id.clone(), spec.offset, spec.length, geometry, shmem));
        info!("umemd: registered block {} ({}..{})", spec.id, spec.offset, spec.offset + spec.length);
    }

    // fault_write: daemon (mig-read/pending-clean) -> ingestor, non-blocking
    // on the write side so mig-read never stalls on notification delivery.
    let (fault_write_read, fault_write_write) = pipe::new_pipe(true).context("fault-write pipe")?;
    // fault_read: ingestor -> daemon (fault thread), blocking both ways.
    let (fault_read_read, fault_read_write) = pipe::new_pipe(false).context("fault-read pipe")?;
    // to_qemu: daemon (pipe thread) -> ingestor/VMM control byte exchange.
    let (to_qemu_read, to_qemu_write) = pipe::new_pipe(false).context("to-qemu pipe")?;
    // from_qemu: ingestor/VMM -> daemon (pipe thread).
    let (from_qemu_read, from_qemu_write) = pipe::new_pipe(false).context("from-qemu pipe")?;

    // SAFETY: called before any threads are spawned, per the `fork(2)`
    // multi-threading caveat; the daemon's five threads are only spawned in
    // the child, after this call returns.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            // The VMM/ingestor keeps the other halves of each pipe; drop our
            // copies so EOF propagates correctly when the daemon exits.
            drop(fault_write_read);
            drop(fault_read_write);
            drop(to_qemu_read);
            drop(from_qemu_write);

            let umem = UffdUmem::new(config.host_page_size as usize).context("creating userfaultfd context")?;
            umem.map(guest_ram_base, cli.guest_ram_length as usize).context("registering guest-ram with userfaultfd")?;
            let umem: Arc<dyn Umem> = Arc::new(umem);

            let pipes = DaemonPipes {
                from_qemu: from_qemu_read,
                to_qemu: to_qemu_write,
                fault_write: fault_write_write,
                fault_read: fault_read_read,
            };

            let daemon = match Daemon::start(&channel as &dyn Channel, blocks, umem, pipes, config, cli.precopy) {
                Ok(d) => d,
                Err(e) => {
                    error!("umemd: daemon failed to start: {e}");
                    std::process::exit(1);
                }
            };
            daemon.wait();
            info!("umemd: daemon converged, exiting");
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            // Only the daemon (child) talks over the migration channel.
            drop(channel);
            drop(fault_write_write);
            drop(fault_read_read);
            drop(to_qemu_write);
            drop(from_qemu_read);

            let combined = unsafe { SharedMemory::from_raw(guest_ram_base, cli.guest_ram_length as usize) };
            let mut inbound = fault_write_read;
            // `outbound`/`inbound` are intentionally named from the
            // ingestor's perspective (spec §4.3): it reads fault offsets on
            // `inbound` and echoes them back on `outbound`.
            let mut outbound = fault_read_write;
            ingestor::run(&mut inbound, &mut outbound, &combined, config.host_page_size);

            info!("umemd: ingestor exited, waiting for daemon (pid {child})");
            let _ = waitpid(child, None);
            Ok(ExitCode::SUCCESS)
        }
    }
}
