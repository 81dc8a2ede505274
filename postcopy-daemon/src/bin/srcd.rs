//! `srcd`: hosts the post-copy source engine (spec §4.2) against a listening
//! migration channel. One process serves exactly one post-copy session,
//! matching the spec's source engine lifecycle (`begin` → `run` →
//! terminal state).

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use postcopy_core::source::{PostcopyOutgoingState, SourceBlock, SourceEngine};
use postcopy_core::SharedMemory;
use postcopy_daemon::scanner::{SequentialDirtyScanner, TokenBucketRateLimiter};
use postcopy_daemon::{init_logging, mmap_block_file, BlockSpec, PageGeometryArgs};
use postcopy_transport_socket::SocketListener;

#[derive(Debug, Parser)]
#[command(name = "srcd", about = "Post-copy source engine host")]
struct Cli {
    /// Migration channel address to listen on, e.g. `tcp:0.0.0.0:4444` or
    /// `unix:/tmp/postcopy.sock`.
    #[arg(long)]
    listen: String,

    /// One memory block, `id:offset:length:path`; repeatable.
    #[arg(long = "block", value_name = "ID:OFFSET:LENGTH:PATH")]
    blocks: Vec<BlockSpec>,

    /// Background-scan rate limit in bytes/sec (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    rate_limit_bytes_per_sec: u64,

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

    info!("srcd: listening on {}", cli.listen);
    let listener = SocketListener::bind(&cli.listen).context("binding migration channel listener")?;
    let channel = listener.accept().context("accepting migration connection")?;
    info!("srcd: migration channel connected");

    let scanner_blocks: Vec<(String, u64)> = cli.blocks.iter().map(|b| (b.id.clone(), geometry.target_pages(b.length))).collect();
    let scanner = SequentialDirtyScanner::new(scanner_blocks);
    let rate_limiter = TokenBucketRateLimiter::new(cli.rate_limit_bytes_per_sec);

    let mut engine = SourceEngine::new(config, scanner, rate_limiter);
    for spec in &cli.blocks {
        let base = mmap_block_file(spec).context("mapping block backing file")?;
        // SAFETY: `mmap_block_file` just mapped `spec.length` bytes at `base`.
        let shmem = unsafe { SharedMemory::from_raw(base, spec.length as usize) };
        engine.register_block(SourceBlock { id: spec.id.clone(), length: spec.length, shmem });
        info!("srcd: registered block {} ({} bytes)", spec.id, spec.length);
    }

    let mut reader = channel.try_clone_reader().context("cloning channel reader")?;
    let mut writer = channel.try_clone_writer().context("cloning channel writer")?;

    engine.begin(&mut writer, None).context("begin()")?;
    let final_state = engine.run(&mut reader, &mut writer);

    match final_state {
        PostcopyOutgoingState::Completed => {
            info!("srcd: session completed");
            Ok(ExitCode::SUCCESS)
        }
        other => {
            error!("srcd: session ended in {other:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}
