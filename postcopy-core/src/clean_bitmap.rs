//! Clean-bitmap transfer (spec §4.6, §6).
//!
//! If pre-copy ran, at post-copy begin the source transmits one record per
//! block — id, offset, length, bitmap length, then the inverted dirty
//! bitmap as big-endian `u64` words — terminated by an all-zero record.

use std::io::{self, Read, Write};

use crate::bitmap::AtomicBitmap;
use crate::error::CodecError;

/// One block's clean-bitmap record, as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanBitmapRecord {
    pub id: String,
    pub offset: u64,
    pub length: u64,
    pub bitmap_bytes: Vec<u8>,
}

/// Encode one block's record. `dirty_bitmap_be_words` is the source's
/// dirty bitmap already serialized as big-endian `u64` words; it is
/// inverted here so a set bit on the wire means "clean" (§4.6).
pub fn encode_record(out: &mut Vec<u8>, id: &str, offset: u64, length: u64, dirty_bitmap_be_words: &[u8]) {
    assert!(id.len() <= crate::codec::MAX_ID_LEN);
    assert_eq!(dirty_bitmap_be_words.len() % 8, 0, "bitmap length must be 8-byte aligned");

    out.push(id.len() as u8);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&(dirty_bitmap_be_words.len() as u64).to_be_bytes());

    for chunk in dirty_bitmap_be_words.chunks_exact(8) {
        let dirty_word = u64::from_be_bytes(chunk.try_into().unwrap());
        out.extend_from_slice(&(!dirty_word).to_be_bytes());
    }
}

/// Encode the all-zero terminator record.
pub fn encode_terminator(out: &mut Vec<u8>) {
    out.push(0);
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
}

/// Read one record (or the terminator) blocking from `r`. Returns `None`
/// on the terminator.
pub fn read_record(r: &mut impl Read) -> io::Result<Option<CleanBitmapRecord>> {
    let mut len_byte = [0u8; 1];
    r.read_exact(&mut len_byte)?;
    let id_len = len_byte[0] as usize;

    let mut id_bytes = vec![0u8; id_len];
    if id_len > 0 {
        r.read_exact(&mut id_bytes)?;
    }

    let mut offset_buf = [0u8; 8];
    r.read_exact(&mut offset_buf)?;
    let offset = u64::from_be_bytes(offset_buf);

    let mut length_buf = [0u8; 8];
    r.read_exact(&mut length_buf)?;
    let length = u64::from_be_bytes(length_buf);

    let mut bitmap_len_buf = [0u8; 8];
    r.read_exact(&mut bitmap_len_buf)?;
    let bitmap_len = u64::from_be_bytes(bitmap_len_buf);

    if id_len == 0 && offset == 0 && length == 0 && bitmap_len == 0 {
        return Ok(None);
    }

    let mut bitmap_bytes = vec![0u8; bitmap_len as usize];
    r.read_exact(&mut bitmap_bytes)?;

    Ok(Some(CleanBitmapRecord {
        id: String::from_utf8_lossy(&id_bytes).into_owned(),
        offset,
        length,
        bitmap_bytes,
    }))
}

/// Write a full clean-bitmap stream (blocking) for a set of blocks,
/// source-side `begin()` (§4.2).
pub fn write_stream(
    w: &mut impl Write,
    blocks: &[(String, u64, u64, Vec<u8>)],
) -> Result<(), CodecError> {
    let mut out = Vec::new();
    for (id, offset, length, dirty_bitmap_be_words) in blocks {
        encode_record(&mut out, id, *offset, *length, dirty_bitmap_be_words);
    }
    encode_terminator(&mut out);
    w.write_all(&out)?;
    Ok(())
}

/// Build an [`AtomicBitmap`] from a decoded record's already-inverted
/// bitmap bytes (destination side, §4.6: stored as `phys_received`).
pub fn bitmap_from_record(record: &CleanBitmapRecord, target_pages: u64) -> AtomicBitmap {
    let bm = AtomicBitmap::new(target_pages);
    // The bytes are already in "clean=1/present=1" sense on the wire once
    // `encode_record` inverted them, so a direct (non-inverting) load is
    // correct here; reuse the inverting loader with a pre-inverted copy to
    // avoid a second bitmap representation.
    let mut re_inverted = Vec::with_capacity(record.bitmap_bytes.len());
    for chunk in record.bitmap_bytes.chunks_exact(8) {
        let w = u64::from_be_bytes(chunk.try_into().unwrap());
        re_inverted.extend_from_slice(&(!w).to_be_bytes());
    }
    bm.load_inverted_be_words(&re_inverted);
    bm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_one_block_and_terminator() {
        let dirty: u64 = 0b0110; // bits 1, 2 dirty
        let mut blocks_buf = Vec::new();
        encode_record(&mut blocks_buf, "ram0", 0, 256, &dirty.to_be_bytes());
        encode_terminator(&mut blocks_buf);

        let mut cursor = io::Cursor::new(blocks_buf);
        let record = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(record.id, "ram0");
        assert_eq!(record.offset, 0);
        assert_eq!(record.length, 256);

        let bm = bitmap_from_record(&record, 4);
        // clean_bitmap / phys_received should be ¬dirty: bit 0 and 3 set.
        assert!(bm.is_set(0));
        assert!(!bm.is_set(1));
        assert!(!bm.is_set(2));
        assert!(bm.is_set(3));

        assert!(read_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn multi_block_stream_round_trips() {
        let mut out = Vec::new();
        let d1: u64 = 0;
        let d2: u64 = u64::MAX;
        encode_record(&mut out, "a", 0, 64, &d1.to_be_bytes());
        encode_record(&mut out, "b", 64, 64, &d2.to_be_bytes());
        encode_terminator(&mut out);

        let mut cursor = io::Cursor::new(out);
        let a = read_record(&mut cursor).unwrap().unwrap();
        let b = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(a.id, "a");
        assert_eq!(b.id, "b");
        assert!(read_record(&mut cursor).unwrap().is_none());
    }
}
