//! Error kinds for the protocol/concurrency engine (spec §7).
//!
//! These are hand-rolled rather than `thiserror`-derived: the core hypervisor
//! logic this engine is grounded on writes its own `Display`/`Error` impls,
//! and the error set here is small and stable enough that a derive macro
//! buys nothing.

use std::fmt;
use std::io;

/// Errors produced while decoding or encoding the request-stream wire codec
/// (§4.1) or the response-stream framing (§6).
#[derive(Debug)]
pub enum CodecError {
    /// An unrecognized command or flag byte. Aborts the session (§7).
    UnknownCommand(u8),
    /// A length prefix would overrun the frame (e.g. id length, section
    /// length, or an offset count larger than the wire allows).
    LengthOverrun { what: &'static str, len: u64, max: u64 },
    /// `MEM_SIZE` observed outside the init section (§9 open question,
    /// resolved in DESIGN.md: rejected as a protocol error).
    MemSizeOutsideInit,
    /// A response flagged `XBZRLE`; the delta codec is out of scope
    /// (SPEC_FULL §10.6) and is rejected rather than guessed at.
    UnsupportedEncoding(&'static str),
    /// Underlying I/O failure while reading/writing a frame.
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownCommand(b) => write!(f, "unknown wire command 0x{b:02x}"),
            CodecError::LengthOverrun { what, len, max } => {
                write!(f, "{what} length {len} exceeds maximum {max}")
            }
            CodecError::MemSizeOutsideInit => {
                write!(f, "MEM_SIZE flag observed outside the init section")
            }
            CodecError::UnsupportedEncoding(name) => {
                write!(f, "unsupported payload encoding: {name}")
            }
            CodecError::Io(e) => write!(f, "codec I/O error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

/// Session-level errors on the source engine (§7): protocol violations,
/// unknown blocks, and I/O failures all collapse a `PostcopyOutgoingState`
/// session to `ERROR_RECEIVE`.
#[derive(Debug)]
pub enum SessionError {
    Codec(CodecError),
    UnknownBlock(String),
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Codec(e) => write!(f, "session codec error: {e}"),
            SessionError::UnknownBlock(id) => write!(f, "request referenced unknown block {id:?}"),
            SessionError::Io(e) => write!(f, "session I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Codec(e) => Some(e),
            SessionError::Io(e) => Some(e),
            SessionError::UnknownBlock(_) => None,
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Codec(e)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Daemon-level errors (§7 "resource" and "unsupported configuration"
/// kinds, plus anything any of the five threads surfaces). Any daemon error
/// sets `ERROR_REQ` on the shared state (§4.5) rather than unwinding.
#[derive(Debug)]
pub enum DaemonError {
    Umem(postcopy_hal::UmemError),
    Io(io::Error),
    Codec(CodecError),
    /// §7 "unsupported configuration": a non-RW channel, or a UMEM device
    /// that reports a host-backed memory path already in use.
    UnsupportedConfig(String),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Umem(e) => write!(f, "UMEM error: {e}"),
            DaemonError::Io(e) => write!(f, "daemon I/O error: {e}"),
            DaemonError::Codec(e) => write!(f, "daemon codec error: {e}"),
            DaemonError::UnsupportedConfig(msg) => write!(f, "unsupported configuration: {msg}"),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Umem(e) => Some(e),
            DaemonError::Io(e) => Some(e),
            DaemonError::Codec(e) => Some(e),
            DaemonError::UnsupportedConfig(_) => None,
        }
    }
}

impl From<postcopy_hal::UmemError> for DaemonError {
    fn from(e: postcopy_hal::UmemError) -> Self {
        DaemonError::Umem(e)
    }
}

impl From<io::Error> for DaemonError {
    fn from(e: io::Error) -> Self {
        DaemonError::Io(e)
    }
}

impl From<CodecError> for DaemonError {
    fn from(e: CodecError) -> Self {
        DaemonError::Codec(e)
    }
}
