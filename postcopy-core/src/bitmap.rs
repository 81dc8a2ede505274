//! Lock-free monotone bitmap (spec §3, §5, §9).
//!
//! Every bitmap in this engine only ever transitions 0→1; losing a race to
//! set a bit is harmless (the loser just observes "already set"), so a
//! per-word atomic `fetch_or` is the whole synchronization discipline. Do
//! not wrap this in a mutex: the mig-write/mig-read concurrency in §4.4
//! depends on these being lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: u64 = 64;

/// A fixed-length, thread-shared bitmap addressed by page index.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Vec<AtomicU64>,
    len_bits: u64,
}

impl AtomicBitmap {
    /// Build a bitmap with room for `len_bits` bits, all initially clear.
    pub fn new(len_bits: u64) -> Self {
        let nwords = (len_bits + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let mut words = Vec::with_capacity(nwords as usize);
        words.resize_with(nwords as usize, || AtomicU64::new(0));
        Self { words, len_bits }
    }

    pub fn len_bits(&self) -> u64 {
        self.len_bits
    }

    fn locate(&self, bit: u64) -> (usize, u64) {
        ((bit / BITS_PER_WORD) as usize, bit % BITS_PER_WORD)
    }

    /// Atomically set `bit` and report whether it was already set. This is
    /// the test-and-set primitive §4.4.1/§4.4.2 build `ram_loaded` and the
    /// mig-write dedup on top of.
    pub fn test_and_set(&self, bit: u64) -> bool {
        assert!(bit < self.len_bits, "bit {bit} out of range ({} bits)", self.len_bits);
        let (word, shift) = self.locate(bit);
        let mask = 1u64 << shift;
        let prev = self.words[word].fetch_or(mask, Ordering::SeqCst);
        prev & mask != 0
    }

    /// Set `bit` without reporting the prior value.
    pub fn set(&self, bit: u64) {
        let _ = self.test_and_set(bit);
    }

    pub fn is_set(&self, bit: u64) -> bool {
        assert!(bit < self.len_bits, "bit {bit} out of range ({} bits)", self.len_bits);
        let (word, shift) = self.locate(bit);
        self.words[word].load(Ordering::SeqCst) & (1u64 << shift) != 0
    }

    /// `true` iff every bit in `bits` is set (used by the host-coarser
    /// "all target bits covering this host page" check in §4.4.1/§4.4.2).
    pub fn all_set(&self, bits: &[u64]) -> bool {
        bits.iter().all(|&b| self.is_set(b))
    }

    /// Population count across the whole bitmap.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.load(Ordering::SeqCst).count_ones() as u64).sum()
    }

    /// Clear `bit`. Only `pending_clean_bitmap` ever clears bits (once
    /// drained by the pending-clean thread, §4.4.4); every other bitmap in
    /// this engine is monotone.
    pub fn clear(&self, bit: u64) -> bool {
        assert!(bit < self.len_bits, "bit {bit} out of range ({} bits)", self.len_bits);
        let (word, shift) = self.locate(bit);
        let mask = 1u64 << shift;
        let prev = self.words[word].fetch_and(!mask, Ordering::SeqCst);
        prev & mask != 0
    }

    /// Iterate the indices of all set bits, in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len_bits).filter(move |&b| self.is_set(b))
    }

    /// Overwrite this bitmap's contents from a big-endian `u64`-word byte
    /// stream (§4.6 clean-bitmap framing), inverting each bit as it is
    /// stored (the wire sense is "clean"; the in-memory sense here is
    /// "present").
    pub fn load_inverted_be_words(&self, bytes: &[u8]) {
        for (word_idx, chunk) in bytes.chunks_exact(8).enumerate() {
            if word_idx >= self.words.len() {
                break;
            }
            let w = u64::from_be_bytes(chunk.try_into().unwrap());
            self.words[word_idx].store(!w, Ordering::SeqCst);
        }
        self.mask_trailing_bits();
    }

    /// Copy every set bit from `other` into `self` (used to seed
    /// `phys_requested`/`clean_bitmap` from the freshly-loaded
    /// `phys_received` at clean-bitmap hand-off, §4.6).
    pub fn copy_from(&self, other: &AtomicBitmap) {
        assert_eq!(self.words.len(), other.words.len());
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            dst.store(src.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    /// Zero any bits beyond `len_bits` in the final word so `count_ones`
    /// and `iter_set` never report padding as data.
    fn mask_trailing_bits(&self) {
        let used_in_last = self.len_bits % BITS_PER_WORD;
        if used_in_last != 0 {
            if let Some(last) = self.words.last() {
                let mask = (1u64 << used_in_last) - 1;
                last.fetch_and(mask, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn monotone_set_never_unsets() {
        let bm = AtomicBitmap::new(128);
        assert!(!bm.test_and_set(5));
        assert!(bm.test_and_set(5));
        assert!(bm.is_set(5));
    }

    #[test]
    fn concurrent_test_and_set_sets_exactly_once_observable() {
        let bm = Arc::new(AtomicBitmap::new(64));
        let mut handles = Vec::new();
        let wins = Arc::new(std::sync::atomic::AtomicU64::new(0));
        for _ in 0..16 {
            let bm = bm.clone();
            let wins = wins.clone();
            handles.push(thread::spawn(move || {
                if !bm.test_and_set(3) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1, "exactly one thread observes the 0->1 transition");
        assert!(bm.is_set(3));
    }

    #[test]
    fn all_set_requires_every_bit() {
        let bm = AtomicBitmap::new(8);
        bm.set(0);
        bm.set(1);
        assert!(!bm.all_set(&[0, 1, 2]));
        bm.set(2);
        assert!(bm.all_set(&[0, 1, 2]));
    }

    #[test]
    fn inverted_load_round_trips() {
        // dirty bitmap D = 0b...0101 (bits 0 and 2 dirty); wire sends ¬D.
        let dirty: u64 = 0b0101;
        let wire_word = !dirty;
        let bytes = wire_word.to_be_bytes();
        let bm = AtomicBitmap::new(64);
        bm.load_inverted_be_words(&bytes);
        // phys_received should equal ¬D: bits 0 and 2 clear, rest set.
        assert!(!bm.is_set(0));
        assert!(bm.is_set(1));
        assert!(!bm.is_set(2));
        assert!(bm.is_set(3));
    }
}
