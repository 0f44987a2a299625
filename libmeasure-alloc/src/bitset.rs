// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

const WORD_BITS: usize = u64::BITS as usize;

/// Tracks which pages of the arena are handed out. A set bit means the page
/// is in use.
pub(crate) struct PageBitset {
    words: Vec<u64>,
    len: usize,
}

impl PageBitset {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    pub fn set_range(&mut self, start: usize, count: usize) {
        for bit in start..(start + count).min(self.len) {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    pub fn clear_range(&mut self, start: usize, count: usize) {
        for bit in start..(start + count).min(self.len) {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Finds the first run of `count` clear bits, sets them, and returns the
    /// index of the first one.
    pub fn find_and_set_range(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut bit = 0;
        while bit < self.len {
            // Skip fully used words quickly.
            if run_len == 0 && bit % WORD_BITS == 0 && self.words[bit / WORD_BITS] == u64::MAX {
                bit += WORD_BITS;
                continue;
            }
            if self.is_set(bit) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = bit;
                }
                run_len += 1;
                if run_len == count {
                    self.set_range(run_start, count);
                    return Some(run_start);
                }
            }
            bit += 1;
        }
        None
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
