//! Streaming-socket backend for the post-copy migration channel
//! (SPEC_FULL §10.1; spec.md §1 "only the streaming-socket path is
//! specified normatively").
//!
//! The engine in `postcopy-core` never touches a socket directly: it asks a
//! `postcopy_core::Channel` for independent reader/writer handles, mirroring
//! how the source scheduler duplicates its migration channel fd into a
//! dedicated `read_fd`/`write_fd` pair (spec §4.2). This crate supplies that
//! `Channel` over either a TCP stream or a Unix domain socket, since
//! QEMU-style migration channels are configured as either.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use postcopy_core::{Channel, ChannelReader, ChannelWriter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect migration channel: {0}")]
    Connect(#[source] std::io::Error),
    #[error("failed to clone migration channel descriptor: {0}")]
    Clone(#[source] std::io::Error),
    #[error("unsupported migration channel address: {0}")]
    UnsupportedAddress(String),
}

/// A duplex migration channel backed by a real streaming socket. `TcpStream`
/// is the common case (migration over the network); `UnixStream` covers the
/// same-host case (e.g. the daemon talking to `srcd` over a local socket).
pub enum SocketChannel {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl SocketChannel {
    /// Connect a TCP migration channel to `addr` (e.g. `"192.0.2.1:4444"`).
    pub fn connect_tcp(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).map_err(TransportError::Connect)?;
        stream.set_nodelay(true).map_err(TransportError::Connect)?;
        Ok(Self::Tcp(stream))
    }

    /// Connect a Unix-domain migration channel to `path`.
    pub fn connect_unix(path: &str) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path).map_err(TransportError::Connect)?;
        Ok(Self::Unix(stream))
    }

    /// Parse a `tcp:host:port` or `unix:/path/to/socket` address, the same
    /// scheme QEMU's `-incoming`/migrate URIs use, and connect it.
    pub fn connect(uri: &str) -> Result<Self, TransportError> {
        if let Some(addr) = uri.strip_prefix("tcp:") {
            Self::connect_tcp(addr)
        } else if let Some(path) = uri.strip_prefix("unix:") {
            Self::connect_unix(path)
        } else {
            Err(TransportError::UnsupportedAddress(uri.to_string()))
        }
    }
}

impl AsRawFd for SocketChannel {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            SocketChannel::Tcp(s) => s.as_raw_fd(),
            SocketChannel::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Channel for SocketChannel {
    fn try_clone_reader(&self) -> std::io::Result<Box<dyn ChannelReader>> {
        match self {
            SocketChannel::Tcp(s) => Ok(Box::new(s.try_clone()?)),
            SocketChannel::Unix(s) => Ok(Box::new(s.try_clone()?)),
        }
    }

    fn try_clone_writer(&self) -> std::io::Result<Box<dyn ChannelWriter>> {
        match self {
            SocketChannel::Tcp(s) => Ok(Box::new(s.try_clone()?)),
            SocketChannel::Unix(s) => Ok(Box::new(s.try_clone()?)),
        }
    }
}

/// A listening endpoint that accepts a single incoming migration connection,
/// used by `srcd` (SPEC_FULL §10.1) to host the source engine.
pub enum SocketListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl SocketListener {
    pub fn bind_tcp(addr: &str) -> Result<Self, TransportError> {
        let listener = std::net::TcpListener::bind(addr).map_err(TransportError::Connect)?;
        Ok(Self::Tcp(listener))
    }

    pub fn bind_unix(path: &str) -> Result<Self, TransportError> {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path).map_err(TransportError::Connect)?;
        Ok(Self::Unix(listener))
    }

    pub fn bind(uri: &str) -> Result<Self, TransportError> {
        if let Some(addr) = uri.strip_prefix("tcp:") {
            Self::bind_tcp(addr)
        } else if let Some(path) = uri.strip_prefix("unix:") {
            Self::bind_unix(path)
        } else {
            Err(TransportError::UnsupportedAddress(uri.to_string()))
        }
    }

    /// Block for exactly one incoming migration connection (a single
    /// post-copy session per `srcd` invocation; see `postcopy-daemon`).
    pub fn accept(&self) -> Result<SocketChannel, TransportError> {
        match self {
            SocketListener::Tcp(l) => {
                let (stream, _addr) = l.accept().map_err(TransportError::Connect)?;
                stream.set_nodelay(true).map_err(TransportError::Connect)?;
                Ok(SocketChannel::Tcp(stream))
            }
            SocketListener::Unix(l) => {
                let (stream, _addr) = l.accept().map_err(TransportError::Connect)?;
                Ok(SocketChannel::Unix(stream))
            }
        }
    }
}
