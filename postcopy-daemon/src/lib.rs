//! Shared CLI plumbing for the `srcd`/`umemd` binaries (SPEC_FULL §10.1,
//! §10.4): argument parsing, logging init, and the `id:offset:length:path`
//! block-spec format both binaries accept.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Result};
use clap::Args;

use postcopy_core::PostcopyConfig;

pub mod scanner;

/// Page-size and scheduling knobs shared by both binaries (SPEC_FULL §10.4):
/// these map directly onto `PostcopyConfig`, constructed once at startup and
/// handed immutably to every thread.
#[derive(Debug, Args)]
pub struct PageGeometryArgs {
    /// Host page size in bytes. Defaults to the OS page size.
    #[arg(long)]
    pub host_page_size: Option<u64>,

    /// Target (guest) page size in bytes. Defaults to `host_page_size`.
    #[arg(long)]
    pub target_page_size: Option<u64>,

    /// Forward prefault count (spec §4.2).
    #[arg(long, default_value_t = 0)]
    pub prefault_forward: u64,

    /// Backward prefault count (spec §4.2).
    #[arg(long, default_value_t = 0)]
    pub prefault_backward: u64,

    /// Background-scan yield budget in milliseconds (spec §4.2, default 50).
    #[arg(long, default_value_t = 50)]
    pub background_yield_budget_ms: u64,

    /// Reposition the background scan cursor near the working set after a
    /// demand batch (spec §4.2 "move-background" mode).
    #[arg(long, default_value_t = false)]
    pub move_background: bool,
}

impl PageGeometryArgs {
    pub fn build_config(&self) -> PostcopyConfig {
        let host_page_size = self.host_page_size.unwrap_or_else(os_page_size);
        let target_page_size = self.target_page_size.unwrap_or(host_page_size);
        PostcopyConfig {
            host_page_size,
            target_page_size,
            prefault_forward: self.prefault_forward,
            prefault_backward: self.prefault_backward,
            background_yield_budget: std::time::Duration::from_millis(self.background_yield_budget_ms),
            move_background: self.move_background,
        }
    }
}

fn os_page_size() -> u64 {
    // SAFETY: `sysconf(_SC_PAGESIZE)` has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as u64
    }
}

/// One `--block id:offset:length:path` spec: a memory block backed by a
/// regular file holding its initial contents (source side) or a
/// shared-memory-backed file the daemon maps (destination side).
#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub id: String,
    pub offset: u64,
    pub length: u64,
    pub path: String,
}

impl std::str::FromStr for BlockSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        let [id, offset, length, path] = parts.as_slice() else {
            bail!("block spec {s:?} must be id:offset:length:path");
        };
        Ok(Self {
            id: id.to_string(),
            offset: offset.parse().context("block offset")?,
            length: length.parse().context("block length")?,
            path: path.to_string(),
        })
    }
}

/// Open (creating if absent) and grow `spec.path` to `spec.length` bytes,
/// then `mmap` it `MAP_SHARED` so the mapping is visible to both this
/// process and anything it later `fork`s (the destination daemon's
/// VMM/daemon split, spec §4.4, Design Note 9).
pub fn mmap_block_file(spec: &BlockSpec) -> Result<*mut u8> {
    mmap_shared_file(&spec.path, spec.length)
}

/// One `--block id:offset:length` spec for `umemd`: a slice of the combined
/// guest-RAM mapping (`--guest-ram`), rather than a file of its own, since
/// the destination maps guest RAM as a single contiguous region registered
/// once with the UMEM device (spec §4.4.2's absolute host-page addressing;
/// `postcopy_core::dest::BlockSet` resolves faults against it directly).
#[derive(Debug, Clone)]
pub struct DestBlockSpec {
    pub id: String,
    pub offset: u64,
    pub length: u64,
}

impl std::str::FromStr for DestBlockSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        let [id, offset, length] = parts.as_slice() else {
            bail!("block spec {s:?} must be id:offset:length");
        };
        Ok(Self {
            id: id.to_string(),
            offset: offset.parse().context("block offset")?,
            length: length.parse().context("block length")?,
        })
    }
}

/// Open (creating if absent), grow to `length` bytes, and `mmap`
/// `MAP_SHARED` the file at `path`. Shared by both binaries: `srcd` maps one
/// independent file per block; `umemd` maps a single file for the whole
/// guest-RAM region before `fork`ing its VMM/daemon split.
pub fn mmap_shared_file(path: &str, length: u64) -> Result<*mut u8> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening backing file {path}"))?;
    file.set_len(length).context("sizing backing file")?;

    use nix::sys::mman::{mmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;
    // SAFETY: `file` is open for read/write and sized to `length` bytes;
    // the returned mapping outlives `file` because `MAP_SHARED` pages are
    // backed by the kernel page cache, not this fd.
    let addr = unsafe {
        mmap(
            None,
            NonZeroUsize::new(length as usize).context("zero-length mapping")?,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    }
    .context("mmap backing file")?;
    Ok(addr.as_ptr() as *mut u8)
}

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
