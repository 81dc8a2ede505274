//! Source engine (spec §4.2): the post-copy scheduler that runs inside the
//! source VMM, serving demand page-fetch requests interleaved with a
//! rate-limited background scan.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use postcopy_hal::poll::{self, Interest};

use crate::block::SharedMemory;
use crate::channel::{ChannelReader, ChannelWriter};
use crate::clean_bitmap;
use crate::codec::{Decoder, Request};
use crate::config::PostcopyConfig;
use crate::error::SessionError;
use crate::response::{ResponseFlags, ResponseHeader};
use crate::source::collab::{DirtyScanner, RateLimiter, ScanStep};
use crate::source::state::PostcopyOutgoingState;

/// A block of guest RAM as the source sees it: just enough to serve page
/// reads. Dirty tracking lives entirely in the [`DirtyScanner`]
/// collaborator (§1: pre-copy convergence heuristics are out of scope).
pub struct SourceBlock {
    pub id: String,
    pub length: u64,
    pub shmem: SharedMemory,
}

/// The source-side post-copy engine. Owns no socket directly; `run()` is
/// handed reader/writer descriptors duplicated from the migration channel,
/// matching §4.2's "`read_fd` is a duplicated descriptor... `write_fd` is
/// the sender".
pub struct SourceEngine<S: DirtyScanner, R: RateLimiter> {
    pub state: PostcopyOutgoingState,
    last_block_read: Option<String>,
    last_response_block: Option<String>,
    blocks: HashMap<String, SourceBlock>,
    config: PostcopyConfig,
    scanner: S,
    rate_limiter: R,
    decoder: Decoder,
}

/// Outcome of [`SourceEngine::request_handler`]: whether the inner drain
/// loop should keep reading or stop because EOC was seen.
enum DrainOutcome {
    Continue,
    StopOnEoc,
}

impl<S: DirtyScanner, R: RateLimiter> SourceEngine<S, R> {
    pub fn new(config: PostcopyConfig, scanner: S, rate_limiter: R) -> Self {
        Self {
            state: PostcopyOutgoingState::Active,
            last_block_read: None,
            last_response_block: None,
            blocks: HashMap::new(),
            config,
            scanner,
            rate_limiter,
            decoder: Decoder::new(),
        }
    }

    pub fn register_block(&mut self, block: SourceBlock) {
        self.blocks.insert(block.id.clone(), block);
    }

    /// §4.2 `begin`: if pre-copy ran, transmit the clean bitmap over the
    /// control channel, flush, reset the rate limiter, and go `Active`.
    pub fn begin(
        &mut self,
        control: &mut impl Write,
        precopy_blocks: Option<&[(String, u64, u64, Vec<u8>)]>,
    ) -> Result<(), SessionError> {
        if let Some(blocks) = precopy_blocks {
            clean_bitmap::write_stream(control, blocks)?;
            control.flush()?;
        }
        self.rate_limiter.reset();
        self.state = PostcopyOutgoingState::Active;
        Ok(())
    }

    /// §4.2 `save_iterate`.
    pub fn save_iterate(&mut self) -> bool {
        self.scanner.save_iterate()
    }

    /// §4.2 `save_complete`: emits `EOS` on the control stream.
    pub fn save_complete(&mut self, control: &mut impl Write) -> io::Result<()> {
        self.scanner.save_complete();
        let header = ResponseHeader::encode(0, ResponseFlags::EOS);
        control.write_all(&header.to_be_bytes())
    }

    /// §4.2 `save_pending`.
    pub fn save_pending(&self) -> u64 {
        self.scanner.save_pending()
    }

    /// §4.2 `run`: the post-copy scheduler loop. Returns once the state is
    /// `Completed` or `ErrorReceive`.
    pub fn run(
        &mut self,
        reader: &mut Box<dyn ChannelReader>,
        writer: &mut Box<dyn ChannelWriter>,
    ) -> PostcopyOutgoingState {
        loop {
            if self.state.is_terminal() {
                return self.state;
            }

            let read_armed = self.state.wants_read();
            let rate_limited = self.rate_limiter.remaining_budget() == 0;
            let write_armed = self.state.wants_write() && !rate_limited;

            let mut interests = Vec::new();
            if read_armed {
                interests.push(Interest::readable(reader.as_raw_fd()));
            }
            if write_armed {
                interests.push(Interest::writable(writer.as_raw_fd()));
            }

            if interests.is_empty() {
                // Nothing armed and not terminal: rate-limited with no
                // read to service. Sleep out the residual window.
                std::thread::sleep(self.rate_limiter.residual_wait().max(Duration::from_millis(1)));
                continue;
            }

            let timeout = if write_armed { None } else { Some(self.rate_limiter.residual_wait()) };
            let readiness = match poll::wait(&interests, timeout) {
                Ok(r) => r,
                Err(_) => continue, // EINTR or transient poll error: retry (Design Note 9)
            };

            let mut idx = 0;
            let read_ready = if read_armed {
                let r = readiness[idx].readable;
                idx += 1;
                r
            } else {
                false
            };
            let write_ready = if write_armed { readiness[idx].writable } else { false };

            if read_ready {
                if let Err(_err) = self.request_handler(reader, writer) {
                    self.state = self.state.on_error();
                }
            } else if write_ready {
                self.background_slice(reader, writer);
            }
        }
    }

    /// §4.2 request handler: drains the read side non-blocking, decoding
    /// requests until `EAGAIN`.
    fn request_handler(
        &mut self,
        reader: &mut Box<dyn ChannelReader>,
        writer: &mut Box<dyn ChannelWriter>,
    ) -> Result<(), SessionError> {
        let mut buf = [0u8; 65536];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Err(SessionError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))),
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(SessionError::Io(e)),
            }

            loop {
                let req = match self.decoder.try_decode() {
                    Ok(Some(req)) => req,
                    Ok(None) => break,
                    Err(e) => return Err(SessionError::Codec(e)),
                };
                match self.dispatch(req, writer)? {
                    DrainOutcome::Continue => {}
                    DrainOutcome::StopOnEoc => return Ok(()),
                }
            }
        }
    }

    fn dispatch(&mut self, req: Request, writer: &mut Box<dyn ChannelWriter>) -> Result<DrainOutcome, SessionError> {
        match req {
            Request::Eoc => {
                self.state = self.state.on_eoc();
                Ok(DrainOutcome::StopOnEoc)
            }
            Request::Page { id, offsets } => {
                if !self.blocks.contains_key(&id) {
                    return Err(SessionError::UnknownBlock(id));
                }
                self.last_block_read = Some(id.clone());
                self.serve_offsets(&id, &offsets, writer)?;
                Ok(DrainOutcome::Continue)
            }
            Request::PageCont { offsets } => {
                let id = self
                    .last_block_read
                    .clone()
                    .ok_or_else(|| SessionError::UnknownBlock(String::new()))?;
                self.serve_offsets(&id, &offsets, writer)?;
                Ok(DrainOutcome::Continue)
            }
        }
    }

    fn serve_offsets(&mut self, block_id: &str, offsets: &[u64], writer: &mut Box<dyn ChannelWriter>) -> Result<(), SessionError> {
        if matches!(self.state, PostcopyOutgoingState::AllPagesSent) {
            // The background scan has already delivered every page.
            return Ok(());
        }

        let mut last_offset = None;
        for &p in offsets {
            self.send_page(block_id, p, writer)?;
            last_offset = Some(p);

            let target_pages = self.blocks[block_id].length / self.config.target_page_size;
            for k in 1..=self.config.prefault_forward {
                let np = p + k;
                if np < target_pages {
                    self.send_page(block_id, np, writer)?;
                }
            }
            for k in 1..=self.config.prefault_backward {
                if p >= k {
                    self.send_page(block_id, p - k, writer)?;
                }
            }
        }

        if self.config.move_background {
            if let Some(last) = last_offset {
                let target_pages = self.blocks[block_id].length / self.config.target_page_size;
                let cursor = (last + self.config.prefault_forward).min(target_pages.saturating_sub(1));
                self.scanner.reposition_cursor(block_id, cursor);
            }
        }
        Ok(())
    }

    fn send_page(&mut self, block_id: &str, page: u64, writer: &mut Box<dyn ChannelWriter>) -> Result<(), SessionError> {
        let byte_offset = page * self.config.target_page_size;
        let continue_flag = self.last_response_block.as_deref() == Some(block_id);
        let mut flags = ResponseFlags::PAGE;
        if continue_flag {
            flags |= ResponseFlags::CONTINUE;
        }
        let header = ResponseHeader::encode(byte_offset, flags);
        writer.write_all(&header.to_be_bytes())?;
        if !continue_flag {
            writer.write_all(&[block_id.len() as u8])?;
            writer.write_all(block_id.as_bytes())?;
            self.last_response_block = Some(block_id.to_string());
        }
        let block = self
            .blocks
            .get(block_id)
            .ok_or_else(|| SessionError::UnknownBlock(block_id.to_string()))?;
        let payload = block.shmem.read_at(byte_offset, self.config.target_page_size as usize);
        writer.write_all(&payload)?;
        self.rate_limiter.record_sent(payload.len() as u64);
        Ok(())
    }

    /// §4.2 background slice: only runs when `Active` and no demand
    /// request is queued (the caller only reaches here via the write-side
    /// of the scheduler loop).
    fn background_slice(&mut self, reader: &mut Box<dyn ChannelReader>, writer: &mut Box<dyn ChannelWriter>) {
        if !self.state.runs_background_slice() {
            return;
        }

        let start = Instant::now();
        let mut blocks_sent: u64 = 0;

        loop {
            // Demand is strictly prioritized: bail out if a read is
            // pending or the write side is no longer writable.
            let check = poll::wait(
                &[Interest::readable(reader.as_raw_fd()), Interest::writable(writer.as_raw_fd())],
                Some(Duration::ZERO),
            );
            if let Ok(readiness) = check {
                if readiness[0].readable || !readiness[1].writable {
                    return;
                }
            }

            let target_page_size = self.config.target_page_size;
            let blocks = &self.blocks;
            let step = {
                let mut send = |id: &str, p: u64| -> io::Result<()> {
                    let block = blocks.get(id).expect("scanner referenced unknown block");
                    let byte_offset = p * target_page_size;
                    let header = ResponseHeader::encode(byte_offset, ResponseFlags::PAGE);
                    writer.write_all(&header.to_be_bytes())?;
                    writer.write_all(&[id.len() as u8])?;
                    writer.write_all(id.as_bytes())?;
                    let payload = block.shmem.read_at(byte_offset, target_page_size as usize);
                    writer.write_all(&payload)
                };
                self.scanner.send_next_dirty_block(&mut send)
            };

            match step {
                Ok(ScanStep::Exhausted) => {
                    self.state = self.state.on_background_exhausted();
                    let header = ResponseHeader::encode(0, ResponseFlags::EOS);
                    let _ = writer.write_all(&header.to_be_bytes());
                    return;
                }
                Ok(ScanStep::Sent { block, offset }) => {
                    blocks_sent += 1;
                    if self.config.move_background {
                        let target_pages = self.blocks[&block].length / self.config.target_page_size;
                        let cursor = (offset + self.config.prefault_forward).min(target_pages.saturating_sub(1));
                        self.scanner.reposition_cursor(&block, cursor);
                    }
                }
                Err(_) => {
                    self.state = self.state.on_error();
                    return;
                }
            }

            if blocks_sent % 64 == 0 && start.elapsed() > self.config.background_yield_budget {
                return;
            }
        }
    }
}
