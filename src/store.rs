//! C5 — `SbfdsStore`: the columnar table itself. Owns the column list,
//! the label-name → column-index map, and `numRows`; answers the
//! exact/range/min-max queries directly against `ColumnData`, and the
//! within-distance / nearest-neighbor queries by driving `ColumnData`
//! through a [`DistanceEvaluator`] and a [`PartialSumCollection`].
//!
//! Concurrency follows the container pattern the whole corpus uses:
//! one `RwLock` around the mutable state, readers taking a shared lock
//! for the duration of a query, writers taking an exclusive one for
//! add/remove/update. A query that finds a label missing drops its
//! read lock, takes a write lock to build it, then re-acquires a read
//! lock — the lock-escalation pattern described in spec.md §5.

use crate::column::ColumnData;
use crate::distance::DistanceEvaluator;
use crate::error::{Result, SbfdsError};
use crate::integer_set::IntegerSet;
use crate::partial_sum::PartialSumCollection;
use crate::value::FeatureValue;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

pub type LabelId = usize;

/// Tunable knobs pulled out of the magic constants the original
/// implementation hard-codes (spec.md §9 "open questions": preserve
/// the values, leave a comment — they carry no documented derivation
/// beyond "this is what was measured to work well").
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Below this many distinct values relative to candidates, a
    /// feature is walked per-value rather than per-candidate during
    /// within-distance accumulation (spec.md §4.5, open question: left
    /// as a parameter rather than hard-coded).
    pub per_value_iteration_threshold_ratio: f64,
    /// Parallel label-build thresholds: many labels and >10k rows, or
    /// >200 rows with >10 added labels.
    pub parallel_build_min_rows_many_labels: usize,
    pub parallel_build_min_rows_few_labels: usize,
    pub parallel_build_min_labels_for_few_rows_threshold: usize,
    /// `max_cases_relative_to_total = min(2000, numInstances / 8)`.
    pub max_cases_relative_cap: usize,
    pub max_cases_relative_divisor: usize,
    /// Soft scan budget while assembling "potentially good matches":
    /// `|candidates| / e`, capped at this value.
    pub potential_match_scan_cap: usize,
    /// Global acceleration toggle: when false, every query degrades to
    /// a linear scan over the candidate set (spec.md §6).
    pub acceleration_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            per_value_iteration_threshold_ratio: 1.0,
            parallel_build_min_rows_many_labels: 10_000,
            parallel_build_min_rows_few_labels: 200,
            parallel_build_min_labels_for_few_rows_threshold: 10,
            max_cases_relative_cap: 2000,
            max_cases_relative_divisor: 8,
            potential_match_scan_cap: 1000,
            acceleration_enabled: true,
        }
    }
}

struct StoreInner {
    columns: Vec<ColumnData>,
    label_ids: HashMap<String, LabelId>,
    label_names: Vec<String>,
    num_rows: usize,
}

impl StoreInner {
    fn new() -> Self {
        StoreInner {
            columns: Vec::new(),
            label_ids: HashMap::new(),
            label_names: Vec::new(),
            num_rows: 0,
        }
    }

    fn column_exists_rows(col: &ColumnData) -> IntegerSet {
        let mut out = col.number_rows().clone();
        out.union_with(col.string_id_rows());
        out.union_with(col.code_rows());
        out.union_with(col.null_rows());
        out
    }
}

/// The columnar, mixed-type instance store.
pub struct SbfdsStore {
    inner: RwLock<StoreInner>,
    config: StoreConfig,
}

impl SbfdsStore {
    pub fn new(config: StoreConfig) -> Self {
        SbfdsStore {
            inner: RwLock::new(StoreInner::new()),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn num_inserted_entities(&self) -> usize {
        self.inner.read().num_rows
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.inner.read().label_ids.contains_key(name)
    }

    pub fn label_id(&self, name: &str) -> Option<LabelId> {
        self.inner.read().label_ids.get(name).copied()
    }

    /// Registers a column per label not already present, sized to the
    /// current row count (every existing row starts "invalid" for the
    /// new label until a value is written). Labels already registered
    /// are left untouched rather than erroring — callers that want
    /// strictness can check `has_label` first.
    pub fn add_labels(&self, labels: &[String]) {
        log::trace!("acquiring write lock to add {} label(s)", labels.len());
        let mut inner = self.inner.write();
        let num_rows = inner.num_rows;
        let mut built = 0usize;
        for label in labels {
            if inner.label_ids.contains_key(label) {
                continue;
            }
            let id = inner.columns.len();
            inner.columns.push(ColumnData::new(num_rows));
            inner.label_ids.insert(label.clone(), id);
            inner.label_names.push(label.clone());
            built += 1;
        }
        if built > 0 {
            log::debug!("built {built} new column(s) at {num_rows} rows ({} total)", inner.columns.len());
        }
    }

    /// Removes every label whose column is entirely invalid (no row
    /// currently uses it). Column removal is swap-pop: the last
    /// column's slot takes the removed one's place, so label ids can
    /// change — callers that cache a `LabelId` across this call must
    /// re-resolve it by name afterward.
    pub fn remove_unused_labels(&self) {
        let mut inner = self.inner.write();
        let num_rows = inner.num_rows;
        let mut i = 0;
        while i < inner.columns.len() {
            let in_use = inner.columns[i].invalid_rows().len() < num_rows;
            if in_use {
                i += 1;
                continue;
            }
            let last = inner.columns.len() - 1;
            let removed_name = inner.label_names[i].clone();
            if i != last {
                inner.columns.swap(i, last);
                inner.label_names.swap(i, last);
                let moved_name = inner.label_names[i].clone();
                inner.label_ids.insert(moved_name, i);
            }
            inner.columns.pop();
            inner.label_names.pop();
            inner.label_ids.remove(&removed_name);
        }
    }

    /// Appends a fresh row populated at the given labels; every other
    /// registered column leaves the new row invalid. Returns the new
    /// row index.
    pub fn add_entity(&self, values: &HashMap<LabelId, FeatureValue>) -> usize {
        log::trace!("acquiring write lock to add an entity");
        let mut inner = self.inner.write();
        let row = inner.num_rows;
        inner.num_rows += 1;
        let new_num_rows = inner.num_rows;
        for (id, col) in inner.columns.iter_mut().enumerate() {
            col.grow_to(new_num_rows);
            if let Some(v) = values.get(&id) {
                col.update_row_value(row, v.clone());
            }
        }
        row
    }

    pub fn update_label(&self, row: usize, label: LabelId, value: FeatureValue) -> Result<()> {
        let mut inner = self.inner.write();
        if row >= inner.num_rows {
            return Err(SbfdsError::RowOutOfBounds(row, inner.num_rows));
        }
        let num_cols = inner.columns.len();
        if label >= num_cols {
            return Err(SbfdsError::UnknownLabel(label.to_string()));
        }
        inner.columns[label].update_row_value(row, value);
        Ok(())
    }

    pub fn update_all_labels(&self, row: usize, values: &HashMap<LabelId, FeatureValue>) -> Result<()> {
        let mut inner = self.inner.write();
        if row >= inner.num_rows {
            return Err(SbfdsError::RowOutOfBounds(row, inner.num_rows));
        }
        for (id, v) in values {
            if *id >= inner.columns.len() {
                continue;
            }
            inner.columns[*id].update_row_value(row, v.clone());
        }
        Ok(())
    }

    /// Drops `row`. If `reassign < numRows` after removal, the last
    /// row's data has been moved into `row`'s old slot (swap-pop);
    /// returns `Some(moved_from)` in that case so the caller can fix
    /// up any external row→id mapping.
    pub fn remove_entity(&self, row: usize) -> Result<Option<usize>> {
        log::trace!("acquiring write lock to remove row {row}");
        let mut inner = self.inner.write();
        if row >= inner.num_rows {
            return Err(SbfdsError::RowOutOfBounds(row, inner.num_rows));
        }
        let mut moved_from = None;
        for col in inner.columns.iter_mut() {
            let m = col.swap_remove_row(row);
            moved_from = Some(m);
        }
        inner.num_rows -= 1;
        if moved_from == Some(row) {
            moved_from = None; // row removed was already the last row
        }
        Ok(moved_from)
    }

    /// Self-check compiled only in debug builds (spec.md §7.3): for
    /// every column, the five disjoint row-sets union to exactly
    /// `numRows` rows with no overlaps, and every row falls in exactly
    /// one. A failure here means a structural violation slipped past
    /// `ColumnData`'s own bookkeeping — not a condition callers should
    /// branch on, only assert against in tests.
    #[cfg(debug_assertions)]
    pub fn verify_all_entities_for_all_columns(&self) -> bool {
        let inner = self.inner.read();
        for col in &inner.columns {
            let mut seen: HashMap<u32, u32> = HashMap::new();
            let sets = [
                col.number_rows(),
                col.string_id_rows(),
                col.code_rows(),
                col.null_rows(),
                col.invalid_rows(),
            ];
            for set in sets {
                for row in set.iter() {
                    *seen.entry(row).or_insert(0) += 1;
                }
            }
            if seen.len() != inner.num_rows {
                return false;
            }
            if seen.values().any(|&count| count != 1) {
                return false;
            }
        }
        true
    }

    fn with_column<R>(&self, label: LabelId, default: R, f: impl FnOnce(&ColumnData) -> R) -> R {
        let inner = self.inner.read();
        match inner.columns.get(label) {
            Some(col) => f(col),
            None => default,
        }
    }

    pub fn entities_with_valid_numbers(&self, label: LabelId) -> IntegerSet {
        self.with_column(label, IntegerSet::new(), |c| c.number_rows().clone())
    }

    pub fn entities_with_valid_string_ids(&self, label: LabelId) -> IntegerSet {
        self.with_column(label, IntegerSet::new(), |c| c.string_id_rows().clone())
    }

    pub fn find_all_with_feature(&self, label: LabelId) -> IntegerSet {
        self.with_column(label, IntegerSet::new(), StoreInner::column_exists_rows)
    }

    pub fn find_all_without_feature(&self, label: LabelId) -> IntegerSet {
        self.with_column(label, IntegerSet::new(), |c| c.invalid_rows().clone())
    }

    /// "First condition" range query: populates a fresh set.
    pub fn find_all_within_range(&self, label: LabelId, lo: f64, hi: f64, inclusive: bool) -> IntegerSet {
        let mut out = IntegerSet::new();
        self.with_column(label, (), |c| c.find_rows_in_range(lo, hi, inclusive, &mut out));
        out
    }

    /// "Subsequent" range query: intersects into a caller-supplied set.
    pub fn intersect_with_range(&self, label: LabelId, lo: f64, hi: f64, inclusive: bool, out: &mut IntegerSet) {
        let mut matched = IntegerSet::new();
        self.with_column(label, (), |c| c.find_rows_in_range(lo, hi, inclusive, &mut matched));
        out.intersect(&matched);
    }

    pub fn intersect_with_feature(&self, label: LabelId, out: &mut IntegerSet) {
        let exists = self.find_all_with_feature(label);
        out.intersect(&exists);
    }

    pub fn intersect_without_feature(&self, label: LabelId, out: &mut IntegerSet) {
        let missing = self.find_all_without_feature(label);
        out.intersect(&missing);
    }

    pub fn union_with_value(&self, label: LabelId, value: &FeatureValue, out: &mut IntegerSet) {
        let inner = self.inner.read();
        if let Some(col) = inner.columns.get(label) {
            let rows = match value {
                FeatureValue::Number(n) => col.rows_equal_to_number(*n),
                FeatureValue::StringId(s) => col.rows_equal_to_string(*s),
                _ => None,
            };
            if let Some(rows) = rows {
                out.union_with(rows);
            }
        }
    }

    /// `among`: union of per-value lookups.
    pub fn find_among(&self, label: LabelId, values: &[FeatureValue]) -> IntegerSet {
        let mut out = IntegerSet::new();
        for v in values {
            self.union_with_value(label, v, &mut out);
        }
        out
    }

    pub fn find_min_max(&self, label: LabelId, k: usize, is_max: bool, within: Option<&IntegerSet>) -> IntegerSet {
        self.with_column(label, IntegerSet::new(), |c| c.find_min_max(k, is_max, within))
    }

    pub fn num_unique_values(&self, label: LabelId, t: crate::value::FeatureValueType) -> usize {
        self.with_column(label, 0, |c| c.unique_value_count(t))
    }

    pub fn get_value(&self, row: usize, label: LabelId) -> Option<FeatureValue> {
        let inner = self.inner.read();
        inner.columns.get(label).map(|c| c.get(row))
    }

    fn strip_zero_weight<'a>(
        &self,
        eval: &'a DistanceEvaluator,
        labels: &[LabelId],
    ) -> Vec<(usize, LabelId)> {
        (0..labels.len())
            .filter(|&i| eval.weight(i) > 0.0)
            .map(|i| (i, labels[i]))
            .collect()
    }

    /// `FindEntitiesWithinDistance` (spec.md §4.5). `radius_label`, if
    /// given, lets each candidate advertise its own admission offset:
    /// a row with radius `r` is accepted once its raw distance ≤
    /// `max_dist + r`.
    pub fn find_entities_within_distance(
        &self,
        eval: &DistanceEvaluator,
        labels: &[LabelId],
        values: &[FeatureValue],
        max_dist: f64,
        radius_label: Option<LabelId>,
        candidates: &IntegerSet,
    ) -> Vec<(usize, f64)> {
        let inner = self.inner.read();
        let active = self.strip_zero_weight(eval, labels);
        if active.is_empty() || candidates.is_empty() {
            return Vec::new();
        }
        let exp_max_dist = eval.exponentiate_term(max_dist.max(0.0), true);

        let mut accumulated: HashMap<u32, f64> = HashMap::with_capacity(candidates.len());
        for row in candidates.iter() {
            let seed = match radius_label.and_then(|rl| inner.columns.get(rl)) {
                Some(col) => match col.get(row as usize).as_number() {
                    Some(r) if !r.is_nan() => -eval.exponentiate_term(r.max(0.0), true),
                    _ => 0.0,
                },
                None => 0.0,
            };
            accumulated.insert(row, seed);
        }

        for &(feat_idx, label) in &active {
            let col = match inner.columns.get(label) {
                Some(c) => c,
                None => continue,
            };
            let target = &values[feat_idx];
            accumulated.retain(|&row, sum| {
                let rv = col.get(row as usize);
                let term = eval.weighted_exponentiated_term(feat_idx, target, &rv, true);
                let new_sum = if term.is_nan() { f64::NAN } else { *sum + term };
                *sum = new_sum;
                !new_sum.is_nan() && new_sum <= exp_max_dist
            });
            if accumulated.is_empty() {
                break;
            }
        }

        accumulated
            .into_iter()
            .map(|(row, exp_sum)| (row as usize, eval.inverse_exponentiate_sum(exp_sum.max(0.0), true)))
            .collect()
    }

    /// `FindNearestEntities` / `FindEntitiesNearestToIndexed` (spec.md
    /// §4.5). `query` is either explicit `(labels, values)` or an
    /// existing row to use as the query point (`ignore_row` excludes
    /// it from the candidate set in the latter case).
    #[allow(clippy::too_many_arguments)]
    pub fn find_nearest_rows(
        &self,
        eval: &DistanceEvaluator,
        labels: &[LabelId],
        query: &[FeatureValue],
        top_k: usize,
        radius_label: Option<LabelId>,
        candidates: &IntegerSet,
        ignore_row: Option<usize>,
        expand_to_first_nonzero_distance: bool,
        rng: &mut impl Rng,
    ) -> Vec<(usize, f64)> {
        if top_k == 0 {
            return Vec::new();
        }
        let inner = self.inner.read();
        let active = self.strip_zero_weight(eval, labels);
        if active.is_empty() {
            return Vec::new();
        }

        let mut working: IntegerSet = candidates.clone();
        if let Some(ig) = ignore_row {
            working.erase(ig as u32);
        }
        if working.is_empty() {
            return Vec::new();
        }

        if working.len() <= top_k {
            return self.linear_distances_sorted(&inner, eval, &active, query, radius_label, &working);
        }

        let num_candidates = working.len();
        let end_index = working.end_bound() as usize;
        let mut psc = PartialSumCollection::new();
        psc.resize_and_clear(active.len(), end_index);

        // seed radius offsets
        if let Some(rl) = radius_label {
            if let Some(rcol) = inner.columns.get(rl) {
                for row in working.iter() {
                    if let Some(r) = rcol.get(row as usize).as_number() {
                        if !r.is_nan() {
                            psc.set_sum(row as usize, -eval.exponentiate_term(r.max(0.0), true));
                        }
                    }
                }
            }
        }

        let mut min_unpopulated: Vec<f64> = vec![0.0; active.len()];
        for (slot, &(feat_idx, label)) in active.iter().enumerate() {
            let col = match inner.columns.get(label) {
                Some(c) => c,
                None => continue,
            };
            let target = &query[feat_idx];
            min_unpopulated[slot] =
                self.populate_partial_sums_with_similar_values(eval, &mut psc, col, feat_idx, slot, target, &working, top_k, num_candidates);
        }

        let epsilon = 2.0 * active.len() as f64 * f64::EPSILON;
        let mut heap = crate::heap::StochasticTieBreakingPriorityQueue::new(top_k, epsilon);

        let scan_cap = ((num_candidates as f64 / std::f64::consts::E) as usize)
            .min(self.config.potential_match_scan_cap)
            .max(top_k);

        let mut scanned = 0usize;
        let mut remaining: Vec<u32> = working.iter().collect();
        // Prioritize rows with at least one feature already populated.
        remaining.sort_by_key(|&r| {
            let (filled, _) = psc.get_num_filled_and_sum(r as usize);
            std::cmp::Reverse(filled)
        });

        for &row in &remaining {
            if scanned >= scan_cap && heap.len() >= top_k {
                break;
            }
            let worst = heap.worst_distance().unwrap_or(f64::INFINITY);
            let mut pruned = false;
            for (slot, &(feat_idx, label)) in active.iter().enumerate() {
                if psc.is_feature_accumulated(row as usize, slot) {
                    continue;
                }
                let col = match inner.columns.get(label) {
                    Some(c) => c,
                    None => continue,
                };
                let target = &query[feat_idx];
                let rv = col.get(row as usize);
                let term = eval.weighted_exponentiated_term(feat_idx, target, &rv, false);
                psc.accum(row as usize, slot, if term.is_nan() { 0.0 } else { term });

                if worst.is_finite() {
                    let (_, partial) = psc.get_num_filled_and_sum(row as usize);
                    let remaining_min: f64 = active
                        .iter()
                        .enumerate()
                        .filter(|&(s, _)| !psc.is_feature_accumulated(row as usize, s) && s != slot)
                        .map(|(s, _)| min_unpopulated[s])
                        .sum();
                    if partial + remaining_min > worst {
                        pruned = true;
                        break;
                    }
                }
            }
            scanned += 1;
            if pruned {
                continue;
            }
            let (_, exp_sum) = psc.get_num_filled_and_sum(row as usize);
            let dist = eval.inverse_exponentiate_sum(exp_sum.max(0.0), false);
            if expand_to_first_nonzero_distance {
                heap.push_and_pop_to_threshold(dist, row);
            } else {
                heap.push_and_pop(dist, row, rng);
            }
        }

        // Random fill if still short of top_k (avoids insertion-order
        // bias when pruning alone can't reach top_k candidates).
        while heap.len() < top_k {
            let remaining_set: IntegerSet = working
                .iter()
                .filter(|r| !heap.contains(r))
                .collect();
            match remaining_set.random_element(rng) {
                Some(row) => {
                    let dist = self.full_distance(&inner, eval, &active, query, row);
                    heap.push(dist, row);
                }
                None => break,
            }
        }
        if expand_to_first_nonzero_distance {
            heap.trim_to_capacity_preserving_ties();
        }

        let mut results: Vec<(usize, f64)> = heap
            .into_sorted_vec()
            .into_iter()
            .map(|(d, row)| (row as usize, d))
            .collect();

        if radius_label.is_some() {
            for (row, dist) in results.iter_mut() {
                *dist = self.full_distance(&inner, eval, &active, query, *row as u32);
            }
            results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }

        results
    }

    fn full_distance(
        &self,
        inner: &StoreInner,
        eval: &DistanceEvaluator,
        active: &[(usize, LabelId)],
        query: &[FeatureValue],
        row: u32,
    ) -> f64 {
        let mut sum = 0.0;
        for &(feat_idx, label) in active {
            if let Some(col) = inner.columns.get(label) {
                let rv = col.get(row as usize);
                let term = eval.weighted_exponentiated_term(feat_idx, &query[feat_idx], &rv, true);
                if !term.is_nan() {
                    sum += term;
                }
            }
        }
        eval.inverse_exponentiate_sum(sum, true)
    }

    fn linear_distances_sorted(
        &self,
        inner: &StoreInner,
        eval: &DistanceEvaluator,
        active: &[(usize, LabelId)],
        query: &[FeatureValue],
        radius_label: Option<LabelId>,
        candidates: &IntegerSet,
    ) -> Vec<(usize, f64)> {
        let mut out: Vec<(usize, f64)> = candidates
            .iter()
            .map(|row| {
                let mut dist = self.full_distance(inner, eval, active, query, row);
                if let Some(rl) = radius_label {
                    if let Some(rcol) = inner.columns.get(rl) {
                        if let Some(r) = rcol.get(row as usize).as_number() {
                            if !r.is_nan() {
                                dist = (dist - r.max(0.0)).max(0.0);
                            }
                        }
                    }
                }
                (row as usize, dist)
            })
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// §4.5.1 — accumulates cheap terms for rows likely to already be
    /// close to `target`, without visiting every candidate. Returns the
    /// distance term of the first feature value not yet populated (the
    /// lower bound used for pruning everyone still unaccumulated).
    #[allow(clippy::too_many_arguments)]
    fn populate_partial_sums_with_similar_values(
        &self,
        eval: &DistanceEvaluator,
        psc: &mut PartialSumCollection,
        col: &ColumnData,
        feat_idx: usize,
        slot: usize,
        target: &FeatureValue,
        candidates: &IntegerSet,
        top_k: usize,
        num_candidates: usize,
    ) -> f64 {
        let feature = eval.feature(feat_idx);
        let cycle_length = feature.cycle_length;
        let cyclic = cycle_length.is_finite() && cycle_length > 0.0;

        if target.is_null() {
            let unknown_unknown = eval.weighted_exponentiated_term(feat_idx, target, &FeatureValue::Null, true);
            let mut any_known_left = false;
            for row in candidates.iter() {
                if col.null_rows().contains(row) {
                    psc.accum(row as usize, slot, unknown_unknown);
                } else {
                    let rv = col.get(row as usize);
                    let term = eval.weighted_exponentiated_term(feat_idx, target, &rv, true);
                    psc.accum(row as usize, slot, if term.is_nan() { 0.0 } else { term });
                    any_known_left = true;
                }
            }
            return if any_known_left { 0.0 } else { f64::INFINITY };
        }

        if !matches!(
            feature.kind,
            crate::distance::FeatureKind::ContinuousNumeric | crate::distance::FeatureKind::ContinuousNumericCyclic
        ) {
            // Nominal (or string/code, treated the same way here): emit
            // zero/match-term to exact matches now; everyone else stays
            // at the non-match term, which is the uncomputed minimum.
            let matched: Vec<u32> = candidates
                .iter()
                .filter(|&r| col.get(r as usize) == *target)
                .collect();
            for row in matched {
                let term = eval.weighted_exponentiated_term(feat_idx, target, target, true);
                psc.accum(row as usize, slot, term);
            }
            return eval.weight(feat_idx) * eval.exponentiate_term(eval.maximum_difference_for_feature(feat_idx), true);
        }

        // Continuous numeric: walk outward from the closest bucket.
        let target_val = target.as_number().unwrap_or(f64::NAN);
        if target_val.is_nan() {
            return f64::INFINITY;
        }
        let max_accept = ((2.0f64.sqrt()).powf(eval.p()) * top_k as usize as f64) as usize;
        let cap = self.config.max_cases_relative_cap.max(num_candidates / self.config.max_cases_relative_divisor.max(1));
        let budget = max_accept.min(cap).max(top_k);

        let mut accepted = 0usize;
        let mut largest_jump = 0.0f64;
        let mut last_dist = 0.0f64;
        let deviation = if feature.deviation.is_nan() { 0.0 } else { feature.deviation };

        for (bucket_val, rows) in col.numeric_buckets_outward(target_val, if cyclic { Some(cycle_length) } else { None }) {
            let matching: Vec<u32> = rows.iter().filter(|r| candidates.contains(*r)).collect();
            if matching.is_empty() {
                continue;
            }
            let raw = {
                let d = (bucket_val - target_val).abs();
                if cyclic {
                    d.min(cycle_length - d)
                } else {
                    d
                }
            };
            let smoothed = (raw - deviation).max(0.0);
            let term = eval.weight(feat_idx) * eval.exponentiate_term(smoothed, true);
            let jump = raw - last_dist;
            for &row in &matching {
                psc.accum(row as usize, slot, term);
            }
            accepted += matching.len();
            last_dist = raw;

            let diminishing = jump >= largest_jump && (jump >= largest_jump.max(0.0) * 0.5 + f64::EPSILON)
                || raw > 5.0 * deviation.max(f64::EPSILON);
            largest_jump = largest_jump.max(jump);
            if accepted >= budget || (matching.len() >= 2 && diminishing) {
                return term;
            }
        }

        eval.weight(feat_idx) * eval.exponentiate_term(eval.maximum_difference_for_feature(feat_idx), true)
    }
}
