//! `StochasticTieBreakingPriorityQueue` — a bounded max-heap used to
//! hold the current best `top_k` candidates during a nearest-neighbor
//! search.
//!
//! A plain bounded max-heap (evict the worst item when a better one
//! arrives) is deterministic but insertion-order-biased at the
//! boundary: if three rows are all at the k-th-best distance, which
//! one survives depends on the order the search happened to visit
//! them, not on anything meaningful. Treating two distances as "equal"
//! whenever they differ by at most `epsilon` and resolving those ties
//! with a coin flip from the caller's PRNG stream fixes that — results
//! are still exactly reproducible given a seed, but not biased toward
//! whichever tied candidate the search order happened to prefer.

use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy)]
struct Entry<T> {
    dist: f64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // NaN never enters a distance comparison in practice (the
        // evaluator channels missing values through known/unknown
        // terms); treat it as "worst" defensively rather than panic.
        self.dist.partial_cmp(&other.dist).unwrap_or(Ordering::Greater)
    }
}

pub struct StochasticTieBreakingPriorityQueue<T> {
    capacity: usize,
    epsilon: f64,
    heap: BinaryHeap<Entry<T>>,
}

impl<T> StochasticTieBreakingPriorityQueue<T> {
    pub fn new(capacity: usize, epsilon: f64) -> Self {
        StochasticTieBreakingPriorityQueue {
            capacity,
            epsilon: epsilon.max(0.0),
            heap: BinaryHeap::with_capacity(capacity.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// The current worst (largest) retained distance, if any.
    pub fn worst_distance(&self) -> Option<f64> {
        self.heap.peek().map(|e| e.dist)
    }

    /// Unconditional insert, no capacity handling — used while filling
    /// below `top_k`.
    pub fn push(&mut self, dist: f64, value: T) {
        self.heap.push(Entry { dist, value });
    }

    /// Inserts `(dist, value)` respecting the bound: below capacity it
    /// is always kept; at capacity, strictly-better candidates evict
    /// the worst, strictly-worse ones are rejected, and candidates
    /// within `epsilon` of the current worst are kept or rejected by a
    /// coin flip from `rng` so no insertion order is favored. Returns
    /// `true` iff the candidate was retained.
    pub fn push_and_pop(&mut self, dist: f64, value: T, rng: &mut impl Rng) -> bool {
        if self.heap.len() < self.capacity {
            self.push(dist, value);
            return true;
        }
        let worst = match self.worst_distance() {
            Some(w) => w,
            None => return false, // capacity == 0
        };
        if dist > worst + self.epsilon {
            return false;
        }
        if dist < worst - self.epsilon {
            self.heap.pop();
            self.heap.push(Entry { dist, value });
            return true;
        }
        // Tied within epsilon of the current worst: keep with 50/50
        // odds so ties are resolved independent of visit order.
        if rng.gen_bool(0.5) {
            self.heap.pop();
            self.heap.push(Entry { dist, value });
            true
        } else {
            false
        }
    }

    /// Like `push_and_pop`, but used when `expand_to_first_nonzero_distance`
    /// is set: candidates within `epsilon` of the current worst are
    /// always kept (growing past `capacity`) rather than coin-flipped,
    /// so every tied result is retained until a strictly worse
    /// candidate is seen.
    pub fn push_and_pop_to_threshold(&mut self, dist: f64, value: T) -> bool {
        if self.heap.len() < self.capacity {
            self.push(dist, value);
            return true;
        }
        let worst = self.worst_distance().unwrap();
        if dist <= worst + self.epsilon {
            self.heap.push(Entry { dist, value });
            true
        } else {
            false
        }
    }

    /// Drops any already-accepted entries past `capacity` that exceed
    /// `worst_distance - epsilon` of the threshold's `capacity`-th
    /// value — used once a caller-chosen final worst distance is known
    /// (after `push_and_pop_to_threshold` was used to over-admit ties).
    pub fn trim_to_capacity_preserving_ties(&mut self) {
        if self.heap.len() <= self.capacity {
            return;
        }
        let mut sorted = std::mem::take(&mut self.heap).into_sorted_vec();
        // into_sorted_vec is ascending; the cut point is the capacity-th
        // smallest, and the tie-band keeps everyone within epsilon of it.
        let cut_dist = sorted[self.capacity - 1].dist;
        sorted.retain(|e| e.dist <= cut_dist + self.epsilon);
        self.heap = sorted.into_iter().collect();
    }

    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.heap.iter().any(|e| &e.value == value)
    }

    /// Drains the queue into ascending-by-distance order.
    pub fn into_sorted_vec(self) -> Vec<(f64, T)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|e| (e.dist, e.value))
            .collect()
    }
}
