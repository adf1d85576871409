// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

/// Fixed-length set of bits backed by `u64` words.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    len: u64,
}

impl BitSet {
    pub fn new(len: u64) -> Self {
        BitSet {
            words: vec![0; len.div_ceil(64) as usize],
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn get(&self, bit: u64) -> bool {
        bit < self.len && self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    fn update_range(&mut self, start: u64, count: u64, set: bool) {
        let end = start.saturating_add(count).min(self.len);
        let mut bit = start;
        while bit < end {
            let word = (bit / 64) as usize;
            let first = bit % 64;
            let n = (64 - first).min(end - bit);
            let mask = if n == 64 {
                u64::MAX
            } else {
                ((1u64 << n) - 1) << first
            };
            if set {
                self.words[word] |= mask;
            } else {
                self.words[word] &= !mask;
            }
            bit += n;
        }
    }

    pub fn set_range(&mut self, start: u64, count: u64) {
        self.update_range(start, count, true);
    }

    pub fn reset_range(&mut self, start: u64, count: u64) {
        self.update_range(start, count, false);
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Sets every bit set in `other`. Both sets must have the same length.
    pub fn union_with(&mut self, other: &BitSet) {
        debug_assert_eq!(self.len, other.len);
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    /// Positions of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().copied().bit_positions()
    }
}

/// Turns a sequence of words into the positions of the bits set in them,
/// treating the sequence as one little-endian integer.
struct BitPositions<I> {
    words: I,
    /// Index of the word in `current`.
    word_index: u64,
    /// Bits of the current word not returned yet.
    current: Option<u64>,
}

impl<I> Iterator for BitPositions<I>
where
    I: Iterator<Item = u64>,
{
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                self.current = Some(self.words.next()?);
            }

            let remaining = self.current?;
            if remaining != 0 {
                let bit = remaining.trailing_zeros();
                // Clear the lowest set bit.
                self.current = Some(remaining & (remaining - 1));
                return Some(self.word_index * 64 + u64::from(bit));
            }

            self.current = None;
            self.word_index += 1;
        }
    }
}

pub trait BitPositionsExt: Iterator<Item = u64> + Sized {
    fn bit_positions(self) -> impl Iterator<Item = u64> {
        BitPositions {
            words: self,
            word_index: 0,
            current: None,
        }
    }
}

impl<I: Iterator<Item = u64> + Sized> BitPositionsExt for I {}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn positions(inp: &[u64]) -> Vec<u64> {
        inp.iter().copied().bit_positions().collect()
    }

    #[test]
    fn bit_positions_works() {
        assert_eq!(positions(&[]), Vec::<u64>::new());
        assert_eq!(positions(&[0]), Vec::<u64>::new());
        assert_eq!(positions(&[5]), [0, 2]);
        assert_eq!(positions(&[1 << 63]), [63]);
        assert_eq!(positions(&[1, 0, 1 + 32]), [0, 128, 133]);
    }

    #[test]
    fn ranges_cross_words() {
        let mut set = BitSet::new(200);
        set.set_range(60, 10);
        assert_eq!(set.iter_set().collect::<Vec<_>>(), (60..70u64).collect::<Vec<_>>());

        set.reset_range(62, 3);
        assert_eq!(set.count(), 7);
        assert!(set.get(61));
        assert!(!set.get(63));
        assert!(set.get(65));

        set.set_range(0, 128);
        assert_eq!(set.count(), 128);

        // Ranges are clipped to the length of the set.
        set.set_range(190, 100);
        assert_eq!(set.count(), 138);
        assert!(!set.get(200));

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn union() {
        let mut a = BitSet::new(70);
        let mut b = BitSet::new(70);
        a.set_range(1, 1);
        b.set_range(65, 2);
        a.union_with(&b);
        assert_eq!(a.iter_set().collect::<Vec<_>>(), [1, 65, 66]);
    }
}
