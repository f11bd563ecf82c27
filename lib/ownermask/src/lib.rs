// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-width bit masks over small indices.
//!
//! The event dispatcher tracks "which tasks still need to see this record"
//! and "which registry slots hold tasks" as bitmaps that get copied, OR'd,
//! and tested on every hot-path operation. A contiguous word array is the
//! whole representation; no allocation, no set abstraction.
//!
//! The word count is a const parameter so the same type covers both the
//! task-width owner masks and the wider registry occupancy masks.

#![forbid(unsafe_code)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A bitset over indices `0..WORDS * 32`.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct BitMask<const WORDS: usize> {
    words: [u32; WORDS],
}

impl<const WORDS: usize> Default for BitMask<WORDS> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const WORDS: usize> BitMask<WORDS> {
    pub const EMPTY: Self = Self { words: [0; WORDS] };

    /// Number of representable indices.
    pub const fn capacity() -> usize {
        WORDS * 32
    }

    /// A mask with exactly one bit set.
    pub fn single(index: usize) -> Self {
        let mut m = Self::EMPTY;
        m.set(index);
        m
    }

    pub fn set(&mut self, index: usize) {
        self.words[index / 32] |= 1 << (index % 32);
    }

    pub fn clear(&mut self, index: usize) {
        self.words[index / 32] &= !(1 << (index % 32));
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words[index / 32] & (1 << (index % 32)) != 0
    }

    /// OR's `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates the set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..32usize)
                .filter(move |&bit| w & (1u32 << bit) != 0)
                .map(move |bit| wi * 32 + bit)
        })
    }

    /// Raw word access, for stats snapshots.
    pub fn words(&self) -> &[u32; WORDS] {
        &self.words
    }
}
