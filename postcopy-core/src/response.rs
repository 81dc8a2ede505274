//! Response-stream framing (source → destination, spec §6) and the
//! migration-stream init section §6 uses to announce whether pre-copy ran.

use bitflags::bitflags;

use crate::error::CodecError;

bitflags! {
    /// Low-order flag bits of an 8-byte response header. The remaining
    /// high-order bits hold the in-block byte offset, which is always
    /// target-page aligned so it never collides with these bits (real page
    /// sizes are at least 256 bytes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseFlags: u64 {
        const MEM_SIZE = 0x01;
        const PAGE     = 0x02;
        const COMPRESS = 0x04;
        const XBZRLE   = 0x08;
        const CONTINUE = 0x10;
        const HOOK     = 0x20;
        const EOS      = 0x40;
    }
}

const FLAG_MASK: u64 = 0xFF;

/// One decoded response-stream header: an in-block offset plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub offset: u64,
    pub flags: ResponseFlags,
}

impl ResponseHeader {
    pub fn encode(offset: u64, flags: ResponseFlags) -> u64 {
        debug_assert_eq!(offset & FLAG_MASK, 0, "offset must be page-aligned to not collide with flag bits");
        offset | flags.bits()
    }

    pub fn decode(header: u64) -> Self {
        Self {
            offset: header & !FLAG_MASK,
            flags: ResponseFlags::from_bits_truncate(header & FLAG_MASK),
        }
    }
}

/// Decoded page payload, per the encoding named in the header's flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw page bytes (`PAGE` flag).
    Raw(Vec<u8>),
    /// A single fill byte, replicated across the page (`COMPRESS` flag;
    /// SPEC_FULL §10.6).
    Fill(u8),
}

impl Payload {
    /// Materialize this payload into a `target_page_size`-byte buffer.
    pub fn materialize(&self, target_page_size: usize) -> Vec<u8> {
        match self {
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Fill(b) => vec![*b; target_page_size],
        }
    }
}

/// Decode a page payload from `flags`, pulling bytes from `body` (already
/// read from the stream: `target_page_size` bytes for `PAGE`, 1 byte for
/// `COMPRESS`). `XBZRLE` is rejected outright (SPEC_FULL §10.6): its delta
/// codec is a separate subsystem this spec never describes.
pub fn decode_payload(flags: ResponseFlags, body: &[u8]) -> Result<Payload, CodecError> {
    if flags.contains(ResponseFlags::XBZRLE) {
        return Err(CodecError::UnsupportedEncoding("XBZRLE"));
    }
    if flags.contains(ResponseFlags::COMPRESS) {
        let &fill = body.first().ok_or(CodecError::LengthOverrun { what: "compress fill byte", len: 0, max: 1 })?;
        return Ok(Payload::Fill(fill));
    }
    if flags.contains(ResponseFlags::PAGE) {
        return Ok(Payload::Raw(body.to_vec()));
    }
    // Neither PAGE nor COMPRESS nor XBZRLE: treat as an empty/zero page,
    // which is how a raw frame with no payload flag is read back.
    Ok(Payload::Raw(body.to_vec()))
}

/// The migration-stream init section subtype byte (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitSubtype {
    Init = 0,
    SectionFull = 1,
}

impl InitSubtype {
    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(InitSubtype::Init),
            1 => Ok(InitSubtype::SectionFull),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// `options` bit 0 of the `INIT` section (§6): whether pre-copy ran before
/// post-copy began.
pub const PRECOPY_USED: u64 = 1 << 0;

/// Maximum `SECTION_FULL` opaque device-state length (§6).
pub const MAX_SECTION_FULL_LEN: u64 = 16 * 1024 * 1024;

/// Encode the `INIT` section.
pub fn encode_init(out: &mut Vec<u8>, options: u64) {
    out.push(InitSubtype::Init as u8);
    out.extend_from_slice(&8u32.to_be_bytes());
    out.extend_from_slice(&options.to_be_bytes());
}

/// Decode an `INIT` section body (after the subtype byte and length have
/// already been read and validated to equal 8).
pub fn decode_init_options(body: &[u8; 8]) -> u64 {
    u64::from_be_bytes(*body)
}
