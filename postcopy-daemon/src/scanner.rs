//! A minimal [`DirtyScanner`] for the standalone `srcd` binary.
//!
//! The real dirty-page iterator (pre-copy's "ordinary dirty-page iterator",
//! spec §4.2) lives in the enclosing migration framework and is out of
//! scope here (spec §1). This is the smallest faithful stand-in: it treats
//! every page of every registered block as initially dirty and serves them
//! once, in block-then-offset order, which is enough to drive the
//! background-scan half of the scheduler loop end-to-end.

use std::io;

use postcopy_core::source::{DirtyScanner, RateLimiter, ScanStep};

pub struct SequentialDirtyScanner {
    blocks: Vec<(String, u64)>, // (id, target_pages)
    block_idx: usize,
    page_idx: u64,
    done: bool,
}

impl SequentialDirtyScanner {
    pub fn new(blocks: Vec<(String, u64)>) -> Self {
        Self { blocks, block_idx: 0, page_idx: 0, done: false }
    }

    fn advance(&mut self) {
        self.page_idx += 1;
        while self.block_idx < self.blocks.len() && self.page_idx >= self.blocks[self.block_idx].1 {
            self.block_idx += 1;
            self.page_idx = 0;
        }
        if self.block_idx >= self.blocks.len() {
            self.done = true;
        }
    }
}

impl DirtyScanner for SequentialDirtyScanner {
    fn save_iterate(&mut self) -> bool {
        self.done || self.blocks.is_empty()
    }

    fn save_complete(&mut self) {}

    fn save_pending(&self) -> u64 {
        if self.done {
            0
        } else {
            self.blocks[self.block_idx..].iter().map(|(_, n)| *n).sum()
        }
    }

    fn send_next_dirty_block(&mut self, send: &mut dyn FnMut(&str, u64) -> io::Result<()>) -> io::Result<ScanStep> {
        if self.done || self.block_idx >= self.blocks.len() {
            self.done = true;
            return Ok(ScanStep::Exhausted);
        }
        let (id, _) = self.blocks[self.block_idx].clone();
        let offset = self.page_idx;
        send(&id, offset)?;
        self.advance();
        Ok(ScanStep::Sent { block: id, offset })
    }

    fn reposition_cursor(&mut self, block: &str, offset: u64) {
        if let Some(idx) = self.blocks.iter().position(|(id, _)| id == block) {
            self.block_idx = idx;
            self.page_idx = offset;
        }
    }
}

/// A token-bucket rate limiter (spec §4.2 `save_pending`/scheduler write
/// arming). `bytes_per_sec == 0` means unlimited. `budget`/`last_refill`
/// are `Cell`s because [`RateLimiter::remaining_budget`] and
/// [`RateLimiter::residual_wait`] take `&self` — the scheduler loop (§4.2)
/// is single-threaded, so interior mutability here is just bookkeeping, not
/// a concurrency primitive.
pub struct TokenBucketRateLimiter {
    bytes_per_sec: u64,
    budget: std::cell::Cell<u64>,
    last_refill: std::cell::Cell<std::time::Instant>,
}

impl TokenBucketRateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            budget: std::cell::Cell::new(bytes_per_sec),
            last_refill: std::cell::Cell::new(std::time::Instant::now()),
        }
    }

    fn refill(&self) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let elapsed = self.last_refill.get().elapsed();
        let gained = (elapsed.as_secs_f64() * self.bytes_per_sec as f64) as u64;
        if gained > 0 {
            self.budget.set((self.budget.get() + gained).min(self.bytes_per_sec));
            self.last_refill.set(std::time::Instant::now());
        }
    }
}

impl RateLimiter for TokenBucketRateLimiter {
    fn remaining_budget(&self) -> u64 {
        self.refill();
        if self.bytes_per_sec == 0 {
            u64::MAX
        } else {
            self.budget.get()
        }
    }

    fn record_sent(&mut self, bytes: u64) {
        if self.bytes_per_sec != 0 {
            self.budget.set(self.budget.get().saturating_sub(bytes));
        }
    }

    fn reset(&mut self) {
        self.budget.set(self.bytes_per_sec);
        self.last_refill.set(std::time::Instant::now());
    }

    fn residual_wait(&self) -> std::time::Duration {
        if self.bytes_per_sec == 0 || self.budget.get() > 0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_millis(10)
        }
    }
}
