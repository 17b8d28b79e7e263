//! # Page bitmap
//!
//! A fixed-length bit set over `u64` words, one bit per fast page. Bits past
//! `len` in the last word are always zero.

use alloc::vec::Vec;
use core::fmt;

const WORD_BITS: usize = u64::BITS as usize;

pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Zeroed bitmap of `len` bits, or `None` if the backing words cannot be
    /// allocated.
    #[must_use]
    pub fn try_new(len: usize) -> Option<Self> {
        let n = len.div_ceil(WORD_BITS);
        let mut words = Vec::new();
        words.try_reserve_exact(n).ok()?;
        words.resize(n, 0);
        Some(Self { words, len })
    }

    /// Number of bits.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing words, least significant bit first.
    #[inline]
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    #[inline]
    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Set bits `[start, start + count)`.
    ///
    /// # Panics
    /// If the range exceeds the bitmap.
    pub fn set_range(&mut self, start: usize, count: usize) {
        self.update_range(start, count, true);
    }

    /// Clear bits `[start, start + count)`.
    ///
    /// # Panics
    /// If the range exceeds the bitmap.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        self.update_range(start, count, false);
    }

    fn update_range(&mut self, start: usize, count: usize, set: bool) {
        let end = start + count;
        assert!(end <= self.len, "bit range {start}..{end} exceeds {}", self.len);

        let mut bit = start;
        while bit < end {
            let word = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = (end - word * WORD_BITS).min(WORD_BITS);
            let mask = word_mask(lo, hi);
            if set {
                self.words[word] |= mask;
            } else {
                self.words[word] &= !mask;
            }
            bit = (word + 1) * WORD_BITS;
        }
    }

    /// Whether every bit in `[start, start + count)` is clear.
    #[must_use]
    pub fn is_range_clear(&self, start: usize, count: usize) -> bool {
        self.next_set(start, start + count).is_none()
    }

    /// First clear bit in `[from, len)`.
    #[must_use]
    pub fn next_clear(&self, from: usize) -> Option<usize> {
        let mut bit = from;
        while bit < self.len {
            let word = bit / WORD_BITS;
            let inverted = !self.words[word] & !word_mask(0, bit % WORD_BITS);
            if inverted != 0 {
                let found = word * WORD_BITS + inverted.trailing_zeros() as usize;
                return (found < self.len).then_some(found);
            }
            bit = (word + 1) * WORD_BITS;
        }
        None
    }

    /// First set bit in `[from, end)`.
    #[must_use]
    pub fn next_set(&self, from: usize, end: usize) -> Option<usize> {
        let end = end.min(self.len);
        let mut bit = from;
        while bit < end {
            let word = bit / WORD_BITS;
            let masked = self.words[word] & !word_mask(0, bit % WORD_BITS);
            if masked != 0 {
                let found = word * WORD_BITS + masked.trailing_zeros() as usize;
                return (found < end).then_some(found);
            }
            bit = (word + 1) * WORD_BITS;
        }
        None
    }

    /// Find the first run of `count` clear bits at or after `start` whose
    /// index is a multiple of `align_mask + 1`.
    ///
    /// `align_mask` must be one less than a power of two. Alignment is
    /// absolute, not relative to `start`.
    #[must_use]
    pub fn find_zero_area(&self, start: usize, count: usize, align_mask: usize) -> Option<usize> {
        let mut from = start;
        loop {
            let zero = self.next_clear(from)?;
            let index = zero.checked_add(align_mask)? & !align_mask;
            let end = index.checked_add(count)?;
            if end > self.len {
                return None;
            }
            match self.next_set(index, end) {
                None => return Some(index),
                Some(busy) => from = busy + 1,
            }
        }
    }

    /// Overwrite every bit with the corresponding bit of `other`.
    ///
    /// # Panics
    /// If the lengths differ.
    pub fn copy_from(&mut self, other: &Self) {
        assert_eq!(self.len, other.len, "bitmap length mismatch");
        self.words.copy_from_slice(&other.words);
    }

    /// Whether every bit set in `self` is also set in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.len == other.len
            && self
                .words
                .iter()
                .zip(&other.words)
                .all(|(a, b)| a & !b == 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Bits `[lo, hi)` of a word, with `hi <= 64`.
#[inline]
const fn word_mask(lo: usize, hi: usize) -> u64 {
    let upper = if hi >= WORD_BITS { u64::MAX } else { (1 << hi) - 1 };
    upper & !((1u64 << lo) - 1)
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.words == other.words
    }
}

impl Eq for Bitmap {}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("set", &self.count_ones())
            .finish()
    }
}
