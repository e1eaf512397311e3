//! C1 — `IntegerSet`: a set of row-indices that transparently picks
//! between a sorted sparse vector and a dense bitmap.
//!
//! ## Why two representations
//!
//! A candidate set during a within-distance or nearest-neighbor query
//! starts as "every row" and is carved down feature by feature. Early on
//! it is dense (most rows still survive) and a bitmap's O(1)
//! insert/erase/contains and cheap word-at-a-time iteration win. Late in
//! a search, or for a handful of rows sharing a rare string value, the
//! set is sparse and a sorted `Vec<u32>` avoids scanning mostly-zero
//! bitmap words. Both layouts answer the same `IntegerSet` API; the
//! layout is an implementation detail we flip automatically, the same
//! way `ColumnData` flips interning under the hood (see `column.rs`).
//!
//! The crossover is density-based: the source keeps a bitmap once
//! density reaches roughly 1/64 (one in every bitmap word has at least
//! one bit on average) and falls back to sparse well below that, with
//! hysteresis so a set hovering near the line doesn't thrash between
//! layouts on every insert/erase.

use rand::Rng;
use std::collections::HashSet;

const BITS_PER_WORD: u32 = 64;
/// Switch sparse -> dense once density reaches this fraction.
const DENSIFY_DENSITY: f64 = 1.0 / 64.0;
/// Switch dense -> sparse only once density drops well below the
/// densify threshold, to avoid flapping right at the boundary.
const SPARSIFY_DENSITY: f64 = 1.0 / 256.0;
/// Below this many entries we never bother converting to a bitmap at
/// all — the fixed cost of a bitmap scan isn't worth it.
const MIN_DENSE_CANDIDATES: usize = 256;

#[derive(Debug, Clone)]
enum Repr {
    /// Sorted, deduplicated row indices.
    Sparse(Vec<u32>),
    /// Bit `i` of `words[i / 64]` set iff row `i` is a member.
    /// `count` is cached so `len()` is O(1).
    Dense { words: Vec<u64>, count: usize },
}

/// A set of row-indices with automatic sparse/dense representation.
#[derive(Debug, Clone)]
pub struct IntegerSet {
    repr: Repr,
}

impl Default for IntegerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegerSet {
    pub fn new() -> Self {
        IntegerSet {
            repr: Repr::Sparse(Vec::new()),
        }
    }

    /// Builds a set containing `0..n` (used to seed "all candidates").
    pub fn full_range(n: u32) -> Self {
        let mut s = IntegerSet::new();
        for i in 0..n {
            s.insert(i);
        }
        s
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Sparse(v) => v.len(),
            Repr::Dense { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the largest member, or 0 if empty. Used to size
    /// per-row scratch buffers (e.g. `PartialSumCollection`).
    pub fn end_bound(&self) -> u32 {
        match &self.repr {
            Repr::Sparse(v) => v.last().map(|&x| x + 1).unwrap_or(0),
            Repr::Dense { words, count } => {
                if *count == 0 {
                    return 0;
                }
                for (wi, w) in words.iter().enumerate().rev() {
                    if *w != 0 {
                        let bit = 63 - w.leading_zeros();
                        return (wi as u32) * BITS_PER_WORD + bit + 1;
                    }
                }
                0
            }
        }
    }

    pub fn contains(&self, i: u32) -> bool {
        match &self.repr {
            Repr::Sparse(v) => v.binary_search(&i).is_ok(),
            Repr::Dense { words, .. } => {
                let w = (i / BITS_PER_WORD) as usize;
                w < words.len() && (words[w] & (1u64 << (i % BITS_PER_WORD))) != 0
            }
        }
    }

    pub fn insert(&mut self, i: u32) {
        match &mut self.repr {
            Repr::Sparse(v) => {
                if let Err(pos) = v.binary_search(&i) {
                    v.insert(pos, i);
                }
            }
            Repr::Dense { words, count } => {
                let w = (i / BITS_PER_WORD) as usize;
                if w >= words.len() {
                    words.resize(w + 1, 0);
                }
                let bit = 1u64 << (i % BITS_PER_WORD);
                if words[w] & bit == 0 {
                    words[w] |= bit;
                    *count += 1;
                }
            }
        }
        self.maybe_densify();
    }

    /// Returns true if the element was present and removed.
    pub fn erase(&mut self, i: u32) -> bool {
        let removed = match &mut self.repr {
            Repr::Sparse(v) => match v.binary_search(&i) {
                Ok(pos) => {
                    v.remove(pos);
                    true
                }
                Err(_) => false,
            },
            Repr::Dense { words, count } => {
                let w = (i / BITS_PER_WORD) as usize;
                if w >= words.len() {
                    false
                } else {
                    let bit = 1u64 << (i % BITS_PER_WORD);
                    if words[w] & bit != 0 {
                        words[w] &= !bit;
                        *count -= 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if removed {
            self.maybe_sparsify();
        }
        removed
    }

    /// Erases `i` and reports whether it had been present, without the
    /// extra branch at call sites that just want the boolean (mirrors
    /// the original `EraseAndRetrieve`).
    pub fn erase_and_retrieve(&mut self, i: u32) -> bool {
        self.erase(i)
    }

    pub fn iter(&self) -> IntegerSetIter<'_> {
        match &self.repr {
            Repr::Sparse(v) => IntegerSetIter::Sparse(v.iter()),
            Repr::Dense { words, .. } => IntegerSetIter::Dense {
                words,
                word_idx: 0,
                cur: 0,
            },
        }
    }

    /// The `n`th element in ascending order, if any.
    pub fn nth_element(&self, n: usize) -> Option<u32> {
        self.iter().nth(n)
    }

    /// A uniformly-random member, using the caller-supplied PRNG stream
    /// (spec.md: "the core consumes a PRNG interface" — never owns one).
    pub fn random_element<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u32> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let k = rng.gen_range(0..n);
        self.nth_element(k)
    }

    /// Keeps only elements also present in `other`.
    pub fn intersect(&mut self, other: &IntegerSet) {
        match &mut self.repr {
            Repr::Sparse(v) => v.retain(|&i| other.contains(i)),
            Repr::Dense { words, count } => {
                *count = 0;
                for (wi, w) in words.iter_mut().enumerate() {
                    let other_word = other.dense_word(wi);
                    *w &= other_word;
                    *count += w.count_ones() as usize;
                }
            }
        }
        self.maybe_sparsify();
    }

    /// Removes every element also present in `other` (set difference).
    pub fn erase_set(&mut self, other: &IntegerSet) {
        match &mut self.repr {
            Repr::Sparse(v) => v.retain(|&i| !other.contains(i)),
            Repr::Dense { words, count } => {
                for (wi, w) in words.iter_mut().enumerate() {
                    let other_word = other.dense_word(wi);
                    let removed_bits = *w & other_word;
                    *w &= !other_word;
                    *count -= removed_bits.count_ones() as usize;
                }
            }
        }
        self.maybe_sparsify();
    }

    /// Adds every element present in `other`.
    pub fn union_with(&mut self, other: &IntegerSet) {
        for i in other.iter() {
            self.insert(i);
        }
    }

    /// Returns the bitmap word `wi` as if this set were dense, without
    /// forcing a representation change — used internally by
    /// intersect/erase_set so the other operand can stay sparse.
    fn dense_word(&self, wi: usize) -> u64 {
        match &self.repr {
            Repr::Dense { words, .. } => words.get(wi).copied().unwrap_or(0),
            Repr::Sparse(v) => {
                let lo = (wi as u32) * BITS_PER_WORD;
                let hi = lo + BITS_PER_WORD;
                let mut w = 0u64;
                // sparse sets participating in boolean ops are expected
                // to be small; a linear scan per word is fine here.
                for &i in v {
                    if i >= lo && i < hi {
                        w |= 1u64 << (i - lo);
                    } else if i >= hi {
                        break;
                    }
                }
                w
            }
        }
    }

    fn density(&self) -> f64 {
        let end = self.end_bound();
        if end == 0 {
            0.0
        } else {
            self.len() as f64 / end as f64
        }
    }

    fn maybe_densify(&mut self) {
        if matches!(self.repr, Repr::Sparse(_))
            && self.len() >= MIN_DENSE_CANDIDATES
            && self.density() >= DENSIFY_DENSITY
        {
            self.to_dense();
        }
    }

    fn maybe_sparsify(&mut self) {
        if matches!(self.repr, Repr::Dense { .. })
            && (self.len() < MIN_DENSE_CANDIDATES || self.density() < SPARSIFY_DENSITY)
        {
            self.to_sparse();
        }
    }

    fn to_dense(&mut self) {
        if let Repr::Sparse(v) = &self.repr {
            let end = v.last().map(|&x| x + 1).unwrap_or(0) as usize;
            let mut words = vec![0u64; (end + 63) / 64];
            for &i in v {
                words[(i / BITS_PER_WORD) as usize] |= 1u64 << (i % BITS_PER_WORD);
            }
            let count = v.len();
            self.repr = Repr::Dense { words, count };
        }
    }

    fn to_sparse(&mut self) {
        if let Repr::Dense { .. } = &self.repr {
            let v: Vec<u32> = self.iter().collect();
            self.repr = Repr::Sparse(v);
        }
    }
}

impl FromIterator<u32> for IntegerSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut s = IntegerSet::new();
        for i in iter {
            s.insert(i);
        }
        s
    }
}

impl<'a> IntoIterator for &'a IntegerSet {
    type Item = u32;
    type IntoIter = IntegerSetIter<'a>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub enum IntegerSetIter<'a> {
    Sparse(std::slice::Iter<'a, u32>),
    Dense {
        words: &'a [u64],
        word_idx: usize,
        cur: u64,
    },
}

impl<'a> Iterator for IntegerSetIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self {
            IntegerSetIter::Sparse(it) => it.next().copied(),
            IntegerSetIter::Dense {
                words,
                word_idx,
                cur,
            } => loop {
                if *cur != 0 {
                    let bit = cur.trailing_zeros();
                    *cur &= *cur - 1;
                    return Some((*word_idx as u32 - 1) * BITS_PER_WORD + bit);
                }
                if *word_idx >= words.len() {
                    return None;
                }
                *cur = words[*word_idx];
                *word_idx += 1;
            },
        }
    }
}

/// A handful of row-indices deduplicated via a hash set — useful when
/// building a candidate set from an unordered source (e.g. a value's
/// row membership before it's known whether the result will densify).
pub fn dedup_sorted(ids: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let set: HashSet<u32> = ids.into_iter().collect();
    let mut v: Vec<u32> = set.into_iter().collect();
    v.sort_unstable();
    v
}
