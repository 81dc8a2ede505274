//! Post-copy live-migration coordination engine: wire codec, atomic
//! bitmaps, the source engine, and the destination daemon thread set.
//!
//! The guest-memory userfault device and OS polling/pipe primitives are
//! supplied by `postcopy-hal`; this crate treats them as collaborators.

pub mod bitmap;
pub mod block;
pub mod channel;
pub mod clean_bitmap;
pub mod codec;
pub mod config;
pub mod dest;
pub mod error;
pub mod response;
pub mod source;

pub use bitmap::AtomicBitmap;
pub use block::{MemoryBlock, SharedMemory};
pub use channel::{Channel, ChannelReader, ChannelWriter};
pub use codec::{Command, Decoder, Request, MAX_ID_LEN, MAX_PAGE_NR};
pub use config::PostcopyConfig;
pub use error::{CodecError, DaemonError, SessionError};
pub use response::{Payload, ResponseFlags, ResponseHeader};
