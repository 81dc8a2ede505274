//! Destination daemon (umemd, spec §4.4): the five long-lived worker
//! threads, the shared state bitset (§4.5), and the block table they
//! coordinate over.

pub mod blockset;
pub mod daemon;
pub mod fault_thread;
pub mod ingestor;
pub mod mig_read;
pub mod mig_write;
pub mod pending_clean;
pub mod pipe_thread;
pub mod state;

pub use blockset::BlockSet;
pub use daemon::{Daemon, DaemonPipes};
pub use pending_clean::PendingCleanSync;
pub use state::{DaemonState, StateFlags};
