//! C6 — `KnnCache`: per-container cache of each relevant row's top-k
//! nearest-neighbor list.
//!
//! The cache is a plain `Vec` indexed by row-index (spec.md §3 "KNN
//! cache"); `Reset` resizes it to the store's current row count and
//! `Precache` fills it for a subset (or every relevant row) by driving
//! [`SbfdsStore::find_nearest_rows`] once per row, one thread per row
//! above [`PARALLEL_PRECACHE_MIN_ROWS`] (spec.md §5). A lookup that
//! holds out an entity, or that finds fewer cached neighbors than
//! requested, falls back to a direct (uncached) search rather than
//! returning a short list — this is the one place the cache is allowed
//! to lie about its own contents to the caller.
//!
//! The cache carries its own position labels, radius label and
//! distance evaluator (spec.md §3, §4.6): it is a view over one data
//! store configured for one query shape, not a general-purpose memo
//! table.

use crate::distance::DistanceEvaluator;
use crate::integer_set::IntegerSet;
use crate::store::{LabelId, SbfdsStore};
use crate::value::FeatureValue;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// Precache runs one row per rayon task once the batch is larger than
/// this (spec.md §5: "precache with more than ~200 rows").
const PARALLEL_PRECACHE_MIN_ROWS: usize = 200;

/// Derives a per-row PRNG stream from a single caller seed so that
/// precache is reproducible regardless of how rayon schedules rows
/// across threads (spec.md §5 "PRNG: each query receives its own
/// stream, split from a caller stream").
fn row_rng(seed: u64, row: usize) -> StdRng {
    // splitmix64-style mix so adjacent rows don't produce correlated
    // streams from a plain XOR.
    let mut z = seed ^ (row as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    StdRng::seed_from_u64(z)
}

/// Per-row sorted `(distance, row)` neighbor lists for one data store,
/// one evaluator, and one set of position labels.
pub struct KnnCache<'s> {
    store: &'s SbfdsStore,
    relevant: IntegerSet,
    eval: DistanceEvaluator,
    position_labels: Vec<LabelId>,
    radius_label: Option<LabelId>,
    cached_neighbors: Vec<Vec<(f64, usize)>>,
}

impl<'s> KnnCache<'s> {
    /// An empty cache bound to `store`; call [`Self::reset`] before use.
    pub fn new(store: &'s SbfdsStore) -> Self {
        KnnCache {
            store,
            relevant: IntegerSet::new(),
            eval: DistanceEvaluator::new(Vec::new(), 2.0).expect("p=2 is always valid"),
            position_labels: Vec::new(),
            radius_label: None,
            cached_neighbors: Vec::new(),
        }
    }

    /// Clears and resizes the cache for a new query shape (spec.md §4.6
    /// `Reset`).
    pub fn reset(
        &mut self,
        relevant_rows: IntegerSet,
        eval: DistanceEvaluator,
        position_labels: Vec<LabelId>,
        radius_label: Option<LabelId>,
    ) {
        self.relevant = relevant_rows;
        self.eval = eval;
        self.position_labels = position_labels;
        self.radius_label = radius_label;
        self.cached_neighbors.clear();
        self.cached_neighbors
            .resize(self.store.num_inserted_entities(), Vec::new());
        log::debug!(
            "rebuilt knn cache shape: {} relevant row(s), {} addressable row(s)",
            self.relevant.len(),
            self.cached_neighbors.len()
        );
    }

    pub fn relevant_entities(&self) -> &IntegerSet {
        &self.relevant
    }

    pub fn num_relevant(&self) -> usize {
        self.relevant.len()
    }

    /// One past the highest row-index this cache can address — the row
    /// count captured at the last `reset`.
    pub fn end_entity_index(&self) -> usize {
        self.cached_neighbors.len()
    }

    fn query_for_row(&self, row: usize) -> Vec<FeatureValue> {
        self.position_labels
            .iter()
            .map(|&l| self.store.get_value(row, l).unwrap_or(FeatureValue::Null))
            .collect()
    }

    /// Fills the per-row neighbor list for every row in `subset` (or
    /// every relevant row if `None`). Runs one rayon task per row once
    /// the batch crosses [`PARALLEL_PRECACHE_MIN_ROWS`] (spec.md §4.6,
    /// §5).
    pub fn precache(
        &mut self,
        subset: Option<&IntegerSet>,
        top_k: usize,
        expand_to_first_nonzero_distance: bool,
        seed: u64,
    ) {
        let rows: Vec<u32> = match subset {
            Some(s) => s.iter().collect(),
            None => self.relevant.iter().collect(),
        };
        log::debug!(
            "precaching top-{top_k} neighbors for {} row(s){}",
            rows.len(),
            if rows.len() > PARALLEL_PRECACHE_MIN_ROWS { " (parallel)" } else { "" }
        );

        // Split out shared borrows up front so the closure below captures
        // only `&` references (all `Sync`), never `&mut self` — required
        // to hand it to rayon's `par_iter` unmodified.
        let store = self.store;
        let eval = &self.eval;
        let position_labels = &self.position_labels;
        let radius_label = self.radius_label;
        let relevant = &self.relevant;

        let compute = |row: u32| -> Vec<(f64, usize)> {
            let mut rng = row_rng(seed, row as usize);
            let query: Vec<FeatureValue> = position_labels
                .iter()
                .map(|&l| store.get_value(row as usize, l).unwrap_or(FeatureValue::Null))
                .collect();
            store.find_nearest_rows(
                eval,
                position_labels,
                &query,
                top_k,
                radius_label,
                relevant,
                None,
                expand_to_first_nonzero_distance,
                &mut rng,
            )
        };

        let results: Vec<(usize, Vec<(f64, usize)>)> = if rows.len() > PARALLEL_PRECACHE_MIN_ROWS {
            rows.par_iter().map(|&r| (r as usize, compute(r))).collect()
        } else {
            rows.iter().map(|&r| (r as usize, compute(r))).collect()
        };

        for (row, neighbors) in results {
            if row < self.cached_neighbors.len() {
                self.cached_neighbors[row] = neighbors;
            }
        }
    }

    /// True if `other` appears among `index`'s cached top-`top_k`
    /// neighbors (spec.md §4.6 `CachedKnnContainsRow`).
    pub fn cached_knn_contains_row(&self, index: usize, other: usize, top_k: usize) -> bool {
        self.cached_neighbors
            .get(index)
            .into_iter()
            .flat_map(|v| v.iter().take(top_k))
            .any(|&(_, r)| r == other)
    }

    /// Returns `index`'s top-`top_k` neighbors, skipping `holdout` if
    /// given. Falls back to a direct search when the cached list (after
    /// removing `holdout`) is shorter than `top_k` or its last entry is
    /// still at distance 0 (spec.md §4.6 `GetKnn`).
    pub fn get_knn(
        &self,
        row: usize,
        top_k: usize,
        expand_to_first_nonzero_distance: bool,
        holdout: Option<usize>,
        seed: u64,
    ) -> Vec<(f64, usize)> {
        if let Some(cached) = self.cached_neighbors.get(row) {
            let mut out = Vec::with_capacity(top_k.min(cached.len()));
            for &(d, r) in cached {
                if Some(r) == holdout {
                    continue;
                }
                out.push((d, r));
                if out.len() >= top_k && d != 0.0 {
                    return out;
                }
            }
        }
        self.get_knn_without_cache(row, top_k, expand_to_first_nonzero_distance, holdout, seed)
    }

    /// Like [`Self::get_knn`], but only considers neighbors in
    /// `from_indices` — both when reading the cache and, if the cached
    /// hits come up short, when falling back to a direct search
    /// restricted to that candidate set (spec.md §4.6 "like the other
    /// `GetKnn`, but only considers `from_indices`").
    pub fn get_knn_within(
        &self,
        row: usize,
        top_k: usize,
        expand_to_first_nonzero_distance: bool,
        from_indices: &IntegerSet,
        seed: u64,
    ) -> Vec<(f64, usize)> {
        if let Some(cached) = self.cached_neighbors.get(row) {
            let mut out = Vec::with_capacity(top_k.min(cached.len()));
            for &(d, r) in cached {
                if !from_indices.contains(r as u32) {
                    continue;
                }
                out.push((d, r));
                if out.len() >= top_k && d != 0.0 {
                    return out;
                }
            }
        }
        let mut rng = row_rng(seed, row);
        let query = self.query_for_row(row);
        self.store.find_nearest_rows(
            &self.eval,
            &self.position_labels,
            &query,
            top_k,
            self.radius_label,
            from_indices,
            None,
            expand_to_first_nonzero_distance,
            &mut rng,
        )
    }

    /// Always performs a direct search, bypassing the cache entirely
    /// (spec.md §4.6 `GetKnnWithoutCache`).
    pub fn get_knn_without_cache(
        &self,
        row: usize,
        top_k: usize,
        expand_to_first_nonzero_distance: bool,
        holdout: Option<usize>,
        seed: u64,
    ) -> Vec<(f64, usize)> {
        let mut rng = row_rng(seed, row);
        let query = self.query_for_row(row);
        self.store.find_nearest_rows(
            &self.eval,
            &self.position_labels,
            &query,
            top_k,
            self.radius_label,
            &self.relevant,
            holdout,
            expand_to_first_nonzero_distance,
            &mut rng,
        )
    }

    /// Direct search against a synthetic query position rather than an
    /// existing row (spec.md §4.6, §4.7 "Positions variant").
    pub fn get_knn_for_position(
        &self,
        values: &[FeatureValue],
        top_k: usize,
        expand_to_first_nonzero_distance: bool,
        seed: u64,
    ) -> Vec<(f64, usize)> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.store.find_nearest_rows(
            &self.eval,
            &self.position_labels,
            values,
            top_k,
            self.radius_label,
            &self.relevant,
            None,
            expand_to_first_nonzero_distance,
            &mut rng,
        )
    }
}
