// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{ErrorKind::IllegalArgument, Result};

/// Interface for Bitset-like structures.
pub trait Bits: Send + Sync {
    fn get(&self, index: usize) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bits implementation that reports every document as live.
pub struct MatchAllBits {
    len: usize,
}

impl MatchAllBits {
    pub fn new(len: usize) -> Self {
        MatchAllBits { len }
    }
}

impl Bits for MatchAllBits {
    fn get(&self, _index: usize) -> bool {
        true
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// BitSet of fixed length (num_bits), backed by a `Vec<u64>`.
///
/// Live docs are kept in a `FixedBitSet` where a set bit means the document
/// is live and a clear bit means it was deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedBitSet {
    bits: Vec<u64>,
    num_bits: usize,
}

impl FixedBitSet {
    pub fn new(num_bits: usize) -> FixedBitSet {
        FixedBitSet {
            bits: vec![0; bits2words(num_bits)],
            num_bits,
        }
    }

    /// A set with every bit in `[0, num_bits)` set.
    pub fn all_set(num_bits: usize) -> FixedBitSet {
        let mut bits = FixedBitSet::new(num_bits);
        for word in &mut bits.bits {
            *word = !0u64;
        }
        bits.clear_ghost_bits();
        bits
    }

    pub fn from_words(words: Vec<u64>, num_bits: usize) -> Result<FixedBitSet> {
        if words.len() != bits2words(num_bits) {
            bail!(IllegalArgument(format!(
                "{} words can not hold exactly {} bits",
                words.len(),
                num_bits
            )));
        }
        let bits = FixedBitSet {
            bits: words,
            num_bits,
        };
        if !bits.verify_ghost_bits_clear() {
            bail!(IllegalArgument("ghost bits are set".into()));
        }
        Ok(bits)
    }

    pub fn words(&self) -> &[u64] {
        &self.bits
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.num_bits);
        self.bits[index >> 6] |= 1u64 << (index & 63);
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.num_bits);
        self.bits[index >> 6] &= !(1u64 << (index & 63));
    }

    /// Clears the bit and returns whether it was set.
    pub fn get_and_clear(&mut self, index: usize) -> bool {
        let word = index >> 6;
        let mask = 1u64 << (index & 63);
        let was_set = self.bits[word] & mask != 0;
        self.bits[word] &= !mask;
        was_set
    }

    /// Returns the number of set bits.
    pub fn cardinality(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn clear_ghost_bits(&mut self) {
        let extra = self.num_bits & 63;
        if extra != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u64 << extra) - 1;
            }
        }
    }

    fn verify_ghost_bits_clear(&self) -> bool {
        let extra = self.num_bits & 63;
        if extra == 0 {
            return true;
        }
        match self.bits.last() {
            Some(last) => last & !((1u64 << extra) - 1) == 0,
            None => true,
        }
    }
}

impl Bits for FixedBitSet {
    #[inline]
    fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.num_bits);
        self.bits[index >> 6] & (1u64 << (index & 63)) != 0
    }

    fn len(&self) -> usize {
        self.num_bits
    }
}

/// Returns the number of 64 bit words it would take to hold num_bits
pub fn bits2words(num_bits: usize) -> usize {
    if num_bits == 0 {
        0
    } else {
        ((num_bits - 1) >> 6) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_cardinality() {
        let mut bits = FixedBitSet::all_set(130);
        assert_eq!(bits.cardinality(), 130);
        assert!(bits.get_and_clear(64));
        assert!(!bits.get_and_clear(64));
        bits.clear(129);
        assert!(!bits.get(129));
        assert!(bits.get(128));
        assert_eq!(bits.cardinality(), 128);
        bits.set(64);
        assert_eq!(bits.cardinality(), 129);
    }

    #[test]
    fn test_from_words_rejects_ghost_bits() {
        assert!(FixedBitSet::from_words(vec![!0u64], 10).is_err());
        assert!(FixedBitSet::from_words(vec![0b11], 10).is_ok());
        assert!(FixedBitSet::from_words(vec![0, 0], 10).is_err());
    }

    #[test]
    fn test_bits2words() {
        assert_eq!(bits2words(0), 0);
        assert_eq!(bits2words(1), 1);
        assert_eq!(bits2words(64), 1);
        assert_eq!(bits2words(65), 2);
    }
}
