//! Request-stream wire codec (spec §4.1, §6).
//!
//! Frames travel destination → source. Each frame begins with a 1-byte
//! command; `PAGE` additionally carries a length-prefixed block id, and
//! `PAGE`/`PAGE_CONT` both carry a big-endian `u32` offset count followed by
//! that many big-endian `u64` target-page offsets.
//!
//! Decoding is restartable: [`Decoder::try_decode`] peeks into an internal
//! buffer and only consumes bytes once a complete frame is present, so a
//! short read leaves the buffer untouched and a subsequent `feed` resumes at
//! the same position.

use crate::error::CodecError;

/// Wire command bytes (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Eoc = 0,
    Page = 1,
    PageCont = 2,
}

impl Command {
    fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0 => Ok(Command::Eoc),
            1 => Ok(Command::Page),
            2 => Ok(Command::PageCont),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

/// Maximum block-id length on the wire (1-byte length prefix).
pub const MAX_ID_LEN: usize = 255;

/// `(32 KiB - 260) / 8`, rounded down: the largest offset count that still
/// fits a single frame under a 32 KiB wire-buffer budget once the command
/// byte, id length/bytes, and count prefix are subtracted (spec §4.1).
pub const MAX_PAGE_NR: usize = (32 * 1024 - 260) / 8;

/// One decoded wire frame. A single *logical* request (arbitrarily many
/// offsets) is fragmented into one `Page` frame followed by zero or more
/// `PageCont` frames by [`encode_logical_request`]; the receiver
/// reassembles the logical sequence by tracking the last block referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Eoc,
    Page { id: String, offsets: Vec<u64> },
    PageCont { offsets: Vec<u64> },
}

/// Encode a single wire frame (no fragmentation) into `out`.
pub fn encode_frame(out: &mut Vec<u8>, req: &Request) {
    match req {
        Request::Eoc => out.push(Command::Eoc as u8),
        Request::Page { id, offsets } => {
            out.push(Command::Page as u8);
            debug_assert!(id.len() <= MAX_ID_LEN);
            out.push(id.len() as u8);
            out.extend_from_slice(id.as_bytes());
            encode_offsets(out, offsets);
        }
        Request::PageCont { offsets } => {
            out.push(Command::PageCont as u8);
            encode_offsets(out, offsets);
        }
    }
}

fn encode_offsets(out: &mut Vec<u8>, offsets: &[u64]) {
    debug_assert!(offsets.len() <= u32::MAX as usize);
    out.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for off in offsets {
        out.extend_from_slice(&off.to_be_bytes());
    }
}

/// Encode a logical request of arbitrarily many offsets against `id`,
/// fragmenting into `PAGE` + `PAGE_CONT*` at [`MAX_PAGE_NR`] boundaries
/// (§4.1, §8 property 5: the fragmentation law). The id is sent exactly
/// once, on the first fragment.
pub fn encode_logical_request(out: &mut Vec<u8>, id: &str, offsets: &[u64]) {
    if offsets.is_empty() {
        encode_frame(out, &Request::Page { id: id.to_string(), offsets: Vec::new() });
        return;
    }
    let mut chunks = offsets.chunks(MAX_PAGE_NR);
    if let Some(first) = chunks.next() {
        encode_frame(
            out,
            &Request::Page { id: id.to_string(), offsets: first.to_vec() },
        );
    }
    for chunk in chunks {
        encode_frame(out, &Request::PageCont { offsets: chunk.to_vec() });
    }
}

/// Incremental, restartable decoder over an append-only byte buffer.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly-read bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// `true` if a well-formed frame is not yet fully buffered and more
    /// input is required. Does not distinguish "empty" from "partial";
    /// callers that care should check `is_empty()` first.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Attempt to decode one frame from the front of the buffer.
    ///
    /// Returns `Ok(None)` ("need more data") without consuming anything if
    /// the buffer does not yet hold a complete frame. Returns `Err` and
    /// leaves the buffer as-is on a malformed command (the caller aborts
    /// the session; there is no recovery from a bad byte stream).
    pub fn try_decode(&mut self) -> Result<Option<Request>, CodecError> {
        let mut cursor = 0usize;
        let Some(&cmd_byte) = self.buf.first() else {
            return Ok(None);
        };
        let cmd = Command::from_byte(cmd_byte)?;
        cursor += 1;

        let request = match cmd {
            Command::Eoc => Some(Request::Eoc),
            Command::Page => {
                let Some(id) = peek_id(&self.buf, &mut cursor)? else {
                    return Ok(None);
                };
                let Some(offsets) = peek_offsets(&self.buf, &mut cursor)? else {
                    return Ok(None);
                };
                Some(Request::Page { id, offsets })
            }
            Command::PageCont => {
                let Some(offsets) = peek_offsets(&self.buf, &mut cursor)? else {
                    return Ok(None);
                };
                Some(Request::PageCont { offsets })
            }
        };

        match request {
            Some(req) => {
                self.buf.drain(..cursor);
                Ok(Some(req))
            }
            None => Ok(None),
        }
    }
}

fn peek_id(buf: &[u8], cursor: &mut usize) -> Result<Option<String>, CodecError> {
    let Some(&len) = buf.get(*cursor) else {
        return Ok(None);
    };
    let len = len as usize;
    let start = *cursor + 1;
    let end = start + len;
    if buf.len() < end {
        return Ok(None);
    }
    let id = String::from_utf8_lossy(&buf[start..end]).into_owned();
    *cursor = end;
    Ok(Some(id))
}

fn peek_offsets(buf: &[u8], cursor: &mut usize) -> Result<Option<Vec<u64>>, CodecError> {
    let start = *cursor;
    if buf.len() < start + 4 {
        return Ok(None);
    }
    let count = u32::from_be_bytes(buf[start..start + 4].try_into().unwrap()) as usize;
    let data_start = start + 4;
    let data_len = count
        .checked_mul(8)
        .ok_or(CodecError::LengthOverrun { what: "offset count", len: count as u64, max: u32::MAX as u64 })?;
    let end = data_start + data_len;
    if buf.len() < end {
        return Ok(None);
    }
    let mut offsets = Vec::with_capacity(count);
    for chunk in buf[data_start..end].chunks_exact(8) {
        offsets.push(u64::from_be_bytes(chunk.try_into().unwrap()));
    }
    *cursor = end;
    Ok(Some(offsets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eoc_round_trips() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, &Request::Eoc);
        let mut dec = Decoder::new();
        dec.feed(&buf);
        assert_eq!(dec.try_decode().unwrap(), Some(Request::Eoc));
    }

    #[test]
    fn page_round_trips_with_id_and_offsets() {
        let mut buf = Vec::new();
        let req = Request::Page { id: "ram0".into(), offsets: vec![2, 0, 3] };
        encode_frame(&mut buf, &req);
        let mut dec = Decoder::new();
        dec.feed(&buf);
        assert_eq!(dec.try_decode().unwrap(), Some(req));
    }

    #[test]
    fn short_read_yields_none_without_consuming() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, &Request::Page { id: "ram0".into(), offsets: vec![1, 2, 3] });
        let mut dec = Decoder::new();
        // feed one byte at a time; decode must return None until complete.
        for i in 0..buf.len() - 1 {
            dec.feed(&buf[i..i + 1]);
            assert_eq!(dec.try_decode().unwrap(), None);
        }
        dec.feed(&buf[buf.len() - 1..]);
        assert!(dec.try_decode().unwrap().is_some());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut dec = Decoder::new();
        dec.feed(&[0xEE]);
        assert!(matches!(dec.try_decode(), Err(CodecError::UnknownCommand(0xEE))));
    }

    #[test]
    fn fragmentation_law_s4() {
        // S4: 5000 offsets -> PAGE(4077) + PAGE_CONT(923)
        let offsets: Vec<u64> = (0..5000).collect();
        let mut buf = Vec::new();
        encode_logical_request(&mut buf, "ram0", &offsets);

        let mut dec = Decoder::new();
        dec.feed(&buf);
        let first = dec.try_decode().unwrap().unwrap();
        let second = dec.try_decode().unwrap().unwrap();
        assert_eq!(dec.try_decode().unwrap(), None);

        let (id, mut reassembled) = match first {
            Request::Page { id, offsets } => (id, offsets),
            _ => panic!("expected PAGE first"),
        };
        assert_eq!(id, "ram0");
        assert_eq!(reassembled.len(), MAX_PAGE_NR);
        match second {
            Request::PageCont { offsets } => {
                assert_eq!(offsets.len(), 5000 - MAX_PAGE_NR);
                reassembled.extend(offsets);
            }
            _ => panic!("expected PAGE_CONT second"),
        }
        assert_eq!(reassembled, offsets);
    }

    #[test]
    fn arbitrary_chunking_decodes_same_sequence() {
        // §8 property 4: codec framing is independent of write chunking.
        let reqs = vec![
            Request::Page { id: "a".into(), offsets: vec![1, 2] },
            Request::PageCont { offsets: vec![3] },
            Request::Eoc,
        ];
        let mut buf = Vec::new();
        for r in &reqs {
            encode_frame(&mut buf, r);
        }
        for chunk_size in [1usize, 2, 3, 7, buf.len()] {
            let mut dec = Decoder::new();
            let mut got = Vec::new();
            for chunk in buf.chunks(chunk_size) {
                dec.feed(chunk);
                while let Some(r) = dec.try_decode().unwrap() {
                    got.push(r);
                }
            }
            assert_eq!(got, reqs);
        }
    }

    proptest::proptest! {
        /// §8 property 4 (framing independent of write chunking) and
        /// property 5 (fragmentation law), exercised over arbitrary offset
        /// counts and arbitrary feed chunk sizes rather than the fixed S4
        /// seed above.
        #[test]
        fn logical_request_round_trips_under_any_chunking(
            id in "[a-z0-9]{1,16}",
            offsets in proptest::collection::vec(0u64..1_000_000, 0..10_000),
            chunk_size in 1usize..4096,
        ) {
            let mut buf = Vec::new();
            encode_logical_request(&mut buf, &id, &offsets);

            let mut dec = Decoder::new();
            let mut reassembled = Vec::new();
            let mut first = true;
            for chunk in buf.chunks(chunk_size) {
                dec.feed(chunk);
                while let Some(req) = dec.try_decode().unwrap() {
                    match req {
                        Request::Page { id: got_id, offsets } => {
                            proptest::prop_assert!(first);
                            proptest::prop_assert_eq!(&got_id, &id);
                            reassembled.extend(offsets);
                            first = false;
                        }
                        Request::PageCont { offsets } => {
                            proptest::prop_assert!(!first);
                            reassembled.extend(offsets);
                        }
                        Request::Eoc => proptest::prop_assert!(false, "unexpected EOC"),
                    }
                }
            }
            proptest::prop_assert_eq!(reassembled, offsets);

            // Every fragment but the last carries exactly MAX_PAGE_NR
            // offsets; only the final one may be shorter (the fragmentation
            // law, §8 property 5).
            let expected_frames = if offsets.is_empty() { 1 } else { offsets.len().div_ceil(MAX_PAGE_NR) };
            let mut dec2 = Decoder::new();
            dec2.feed(&buf);
            let mut frame_count = 0;
            while let Some(_req) = dec2.try_decode().unwrap() {
                frame_count += 1;
            }
            proptest::prop_assert_eq!(frame_count, expected_frames);
        }
    }
}
