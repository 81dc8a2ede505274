//! Alternative RDMA backend for the migration channel (spec §9, §4.2,
//! §4.4; SPEC_FULL §10.1).
//!
//! The spec treats RDMA as "an alternative transport that satisfies the
//! same logical contract... specifying its zero-copy semantics is out of
//! scope here" and SPEC_FULL is explicit that this crate "delegates to the
//! socket framing internally" rather than reimplementing verb-level
//! zero-copy transfer. What this crate contributes over plain
//! `postcopy-transport-socket` is the connection-setup shape an RDMA
//! backend actually needs (a rendezvous address plus a queue-pair-count
//! knob), while every byte still moves over the same `Channel` contract the
//! engine already speaks.

use log::info;
use thiserror::Error;

use postcopy_core::{Channel, ChannelReader, ChannelWriter};
use postcopy_transport_socket::{SocketChannel, SocketListener, TransportError};

#[derive(Debug, Error)]
pub enum RdmaError {
    #[error("RDMA rendezvous transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("RDMA queue pair count must be non-zero")]
    InvalidQueuePairCount,
}

/// Connection parameters for the RDMA backend. `queue_pairs` is accepted
/// and validated so the CLI surface (`postcopy-daemon`) has somewhere to
/// plumb it, but it does not change which bytes flow: the zero-copy verb
/// path this field would otherwise select is unspecified by the
/// contract this crate is grounded on (spec §9).
#[derive(Debug, Clone, Copy)]
pub struct RdmaConfig {
    pub queue_pairs: u32,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self { queue_pairs: 1 }
    }
}

/// A migration channel over the RDMA backend. Internally this is the same
/// streaming-socket rendezvous connection as `postcopy-transport-socket`;
/// see the module doc for why that is the correct scope for this crate.
pub struct RdmaChannel {
    inner: SocketChannel,
    #[allow(dead_code)]
    config: RdmaConfig,
}

impl RdmaChannel {
    pub fn connect(uri: &str, config: RdmaConfig) -> Result<Self, RdmaError> {
        if config.queue_pairs == 0 {
            return Err(RdmaError::InvalidQueuePairCount);
        }
        info!("rdma: establishing rendezvous connection to {uri} ({} queue pairs)", config.queue_pairs);
        let inner = SocketChannel::connect(uri)?;
        Ok(Self { inner, config })
    }
}

impl Channel for RdmaChannel {
    fn try_clone_reader(&self) -> std::io::Result<Box<dyn ChannelReader>> {
        self.inner.try_clone_reader()
    }

    fn try_clone_writer(&self) -> std::io::Result<Box<dyn ChannelWriter>> {
        self.inner.try_clone_writer()
    }
}

/// Listening side of the RDMA rendezvous, used by `srcd` when started with
/// the RDMA backend selected.
pub struct RdmaListener {
    inner: SocketListener,
    config: RdmaConfig,
}

impl RdmaListener {
    pub fn bind(uri: &str, config: RdmaConfig) -> Result<Self, RdmaError> {
        if config.queue_pairs == 0 {
            return Err(RdmaError::InvalidQueuePairCount);
        }
        let inner = SocketListener::bind(uri)?;
        Ok(Self { inner, config })
    }

    pub fn accept(&self) -> Result<RdmaChannel, RdmaError> {
        let inner = self.inner.accept()?;
        Ok(RdmaChannel { inner, config: self.config })
    }
}
