//! C2 — `ColumnData`: per-feature columnar storage.
//!
//! Each column owns one label's worth of data for every row in the
//! store: a cell per row (number / string-id / code / null), plus
//! indices that make "find every row with value V" and "find every row
//! whose value falls in [lo, hi]" cheap:
//!
//! - `numbers`: `value -> rowset`, kept in natural numeric order so
//!   range, min/max and closest-value queries are a B-tree walk.
//! - `strings`: `string-id -> rowset`, ordered by the numeric id (no
//!   claim about lexical order — the caller's string-intern pool owns
//!   lexical semantics; this column only needs *a* total order to walk).
//! - `codes`: rows holding a code value, bucketed by deep-size so
//!   size-bounded scans don't have to touch every code row.
//! - five disjoint row-sets (`numberRows`, `stringIdRows`, `codeRows`,
//!   `nullRows`, `invalidRows`) whose union is exactly every inserted
//!   row — this is the §8 invariant property tests check.
//!
//! ## Interning
//!
//! When a column has few distinct values relative to its row count, it
//! is cheaper to store a small per-row index into a dedup table than a
//! full `FeatureValue` per row (8 bytes vs. up to a fat `Arc` or `f64`
//! plus tag). `OptimizeColumn` flips between the two layouts based on a
//! quadratic heuristic (`#distinct <= sqrt(2 * #rows)`); both layouts
//! answer every read through [`Cells::get`], so nothing outside this
//! module ever needs to know which one is active.

use crate::integer_set::IntegerSet;
use crate::value::{CodeHandle, FeatureValue, FeatureValueType, StringId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
struct NumKey(f64);
impl Eq for NumKey {}
impl PartialOrd for NumKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for NumKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// The two interchangeable per-row storage layouts. Never exposed
/// outside this module — every caller goes through `Cells::get`.
#[derive(Debug, Clone)]
enum Cells {
    /// One full value per row.
    Direct(Vec<FeatureValue>),
    /// One small index per row into `table`, the deduplicated value
    /// list. `lookup_num`/`lookup_str` make `InsertRowValue` able to
    /// find an existing table entry without a linear scan.
    Interned {
        indices: Vec<u32>,
        table: Vec<FeatureValue>,
        lookup_num: HashMap<u64, u32>,
        lookup_str: HashMap<StringId, u32>,
    },
}

impl Cells {
    fn len(&self) -> usize {
        match self {
            Cells::Direct(v) => v.len(),
            Cells::Interned { indices, .. } => indices.len(),
        }
    }

    /// Resolves row `row`'s value regardless of which layout is active.
    fn get(&self, row: usize) -> FeatureValue {
        match self {
            Cells::Direct(v) => v[row].clone(),
            Cells::Interned { indices, table, .. } => table[indices[row] as usize].clone(),
        }
    }

    fn push_direct(&mut self, value: FeatureValue) {
        match self {
            Cells::Direct(v) => v.push(value),
            Cells::Interned { .. } => unreachable!("push_direct on interned cells"),
        }
    }

    fn set_direct(&mut self, row: usize, value: FeatureValue) {
        match self {
            Cells::Direct(v) => v[row] = value,
            Cells::Interned { .. } => unreachable!("set_direct on interned cells"),
        }
    }

    fn push_interned(&mut self, value: FeatureValue) {
        match self {
            Cells::Interned {
                indices,
                table,
                lookup_num,
                lookup_str,
            } => {
                let idx = intern_lookup_or_insert(table, lookup_num, lookup_str, &value);
                indices.push(idx);
            }
            Cells::Direct(_) => unreachable!("push_interned on direct cells"),
        }
    }

    fn set_interned(&mut self, row: usize, value: FeatureValue) {
        match self {
            Cells::Interned {
                indices,
                table,
                lookup_num,
                lookup_str,
            } => {
                let idx = intern_lookup_or_insert(table, lookup_num, lookup_str, &value);
                indices[row] = idx;
            }
            Cells::Direct(_) => unreachable!("set_interned on direct cells"),
        }
    }

    fn swap_remove_row(&mut self, row: usize) {
        match self {
            Cells::Direct(v) => {
                v.swap_remove(row);
            }
            Cells::Interned { indices, .. } => {
                indices.swap_remove(row);
            }
        }
    }
}

fn intern_lookup_or_insert(
    table: &mut Vec<FeatureValue>,
    lookup_num: &mut HashMap<u64, u32>,
    lookup_str: &mut HashMap<StringId, u32>,
    value: &FeatureValue,
) -> u32 {
    match value {
        FeatureValue::Number(n) if !n.is_nan() => {
            let key = n.to_bits();
            *lookup_num.entry(key).or_insert_with(|| {
                table.push(value.clone());
                (table.len() - 1) as u32
            })
        }
        FeatureValue::StringId(s) => *lookup_str.entry(*s).or_insert_with(|| {
            table.push(value.clone());
            (table.len() - 1) as u32
        }),
        // Null and Code values are never deduplicated: null carries no
        // information to dedup on, and code equality is a deep
        // comparison we don't want to pay on every insert.
        _ => {
            table.push(value.clone());
            (table.len() - 1) as u32
        }
    }
}

/// Per-feature columnar storage: one label's values for every row,
/// plus the indices that answer exists/range/min-max/closest-value
/// queries in better than O(rows) time.
#[derive(Debug, Clone)]
pub struct ColumnData {
    cells: Cells,

    numbers: BTreeMap<NumKey, IntegerSet>,
    strings: BTreeMap<StringId, IntegerSet>,
    /// code rows bucketed by deep-size, for size-bounded scans.
    codes_by_size: BTreeMap<usize, IntegerSet>,

    number_rows: IntegerSet,
    string_id_rows: IntegerSet,
    code_rows: IntegerSet,
    null_rows: IntegerSet,
    invalid_rows: IntegerSet,

    num_rows: usize,
}

impl ColumnData {
    pub fn new(num_rows: usize) -> Self {
        ColumnData {
            cells: Cells::Direct(Vec::with_capacity(num_rows)),
            numbers: BTreeMap::new(),
            strings: BTreeMap::new(),
            codes_by_size: BTreeMap::new(),
            number_rows: IntegerSet::new(),
            string_id_rows: IntegerSet::new(),
            code_rows: IntegerSet::new(),
            null_rows: IntegerSet::new(),
            invalid_rows: IntegerSet::full_range(num_rows as u32),
            num_rows,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn number_rows(&self) -> &IntegerSet {
        &self.number_rows
    }
    pub fn string_id_rows(&self) -> &IntegerSet {
        &self.string_id_rows
    }
    pub fn code_rows(&self) -> &IntegerSet {
        &self.code_rows
    }
    pub fn null_rows(&self) -> &IntegerSet {
        &self.null_rows
    }
    pub fn invalid_rows(&self) -> &IntegerSet {
        &self.invalid_rows
    }

    /// Reserves room for `additional` more rows without changing
    /// `num_rows` — used by bulk `AddLabels` builds.
    pub fn reserve(&mut self, additional: usize) {
        if let Cells::Direct(v) = &mut self.cells {
            v.reserve(additional);
        }
    }

    /// Grows the column to `new_num_rows`, marking every newly added
    /// row invalid (feature absent) until a value is inserted.
    pub fn grow_to(&mut self, new_num_rows: usize) {
        debug_assert!(new_num_rows >= self.num_rows);
        for r in self.num_rows..new_num_rows {
            if let Cells::Direct(v) = &mut self.cells {
                v.push(FeatureValue::Null);
            } else {
                self.cells.push_interned(FeatureValue::Null);
            }
            // Newly grown rows are "invalid" (feature absent), not
            // "null" — they were never added to `null_rows` to begin
            // with, so no bookkeeping is needed there.
            self.invalid_rows.insert(r as u32);
        }
        self.num_rows = new_num_rows;
    }

    fn remove_from_indices(&mut self, row: usize, value: &FeatureValue) {
        let r = row as u32;
        match value.value_type() {
            FeatureValueType::Number => {
                let n = value.as_number().unwrap();
                if let Some(set) = self.numbers.get_mut(&NumKey(n)) {
                    set.erase(r);
                    if set.is_empty() {
                        self.numbers.remove(&NumKey(n));
                    }
                }
                self.number_rows.erase(r);
            }
            FeatureValueType::StringId => {
                let s = value.as_string_id().unwrap();
                if let Some(set) = self.strings.get_mut(&s) {
                    set.erase(r);
                    if set.is_empty() {
                        self.strings.remove(&s);
                    }
                }
                self.string_id_rows.erase(r);
            }
            FeatureValueType::Code => {
                let size = value.as_code().unwrap().deep_size();
                if let Some(set) = self.codes_by_size.get_mut(&size) {
                    set.erase(r);
                    if set.is_empty() {
                        self.codes_by_size.remove(&size);
                    }
                }
                self.code_rows.erase(r);
            }
            FeatureValueType::Null => {
                self.null_rows.erase(r);
            }
            FeatureValueType::Invalid => {
                self.invalid_rows.erase(r);
            }
        }
    }

    fn add_to_indices(&mut self, row: usize, value: &FeatureValue) {
        let r = row as u32;
        match value.value_type() {
            FeatureValueType::Number => {
                let n = value.as_number().unwrap();
                self.numbers.entry(NumKey(n)).or_default().insert(r);
                self.number_rows.insert(r);
            }
            FeatureValueType::StringId => {
                let s = value.as_string_id().unwrap();
                self.strings.entry(s).or_default().insert(r);
                self.string_id_rows.insert(r);
            }
            FeatureValueType::Code => {
                let size = value.as_code().unwrap().deep_size();
                self.codes_by_size.entry(size).or_default().insert(r);
                self.code_rows.insert(r);
            }
            FeatureValueType::Null => {
                self.null_rows.insert(r);
            }
            FeatureValueType::Invalid => {
                self.invalid_rows.insert(r);
            }
        }
    }

    /// Replaces the value at `row` (remove then reinsert).
    pub fn update_row_value(&mut self, row: usize, value: FeatureValue) {
        let old = self.cells.get(row);
        self.remove_from_indices(row, &old);
        self.invalid_rows.erase(row as u32);
        self.add_to_indices(row, &value);
        if matches!(self.cells, Cells::Direct(_)) {
            self.cells.set_direct(row, value);
        } else {
            self.cells.set_interned(row, value);
        }
    }

    /// Marks `row` as not carrying this feature (moves it into
    /// `invalid_rows`), removing it from whichever index held it.
    pub fn remove_row_value(&mut self, row: usize) {
        let old = self.cells.get(row);
        self.remove_from_indices(row, &old);
        self.invalid_rows.insert(row as u32);
        if matches!(self.cells, Cells::Direct(_)) {
            self.cells.set_direct(row, FeatureValue::Null);
        } else {
            self.cells.set_interned(row, FeatureValue::Null);
        }
    }

    /// Swap-pop: moves the last row's data into `row`'s slot, shrinking
    /// the column by one. Returns the row index that was moved from
    /// (== `num_rows - 1`), so callers can remap any external mapping.
    pub fn swap_remove_row(&mut self, row: usize) -> usize {
        let last = self.num_rows - 1;
        if row != last {
            let moved_value = self.cells.get(last);
            let old_value = self.cells.get(row);
            self.remove_from_indices(row, &old_value);
            self.remove_from_indices(last, &moved_value);
            self.add_to_indices(row, &moved_value);

            let was_invalid = self.invalid_rows.contains(last as u32);
            self.invalid_rows.erase(last as u32);
            self.invalid_rows.erase(row as u32);
            if was_invalid {
                self.invalid_rows.insert(row as u32);
            }

            match &mut self.cells {
                Cells::Direct(v) => {
                    v[row] = moved_value;
                }
                Cells::Interned { indices, .. } => {
                    indices[row] = indices[last];
                }
            }
        } else {
            let old_value = self.cells.get(row);
            self.remove_from_indices(row, &old_value);
            self.invalid_rows.erase(row as u32);
        }
        self.cells.swap_remove_row(last);
        self.num_rows -= 1;
        last
    }

    pub fn get(&self, row: usize) -> FeatureValue {
        if self.invalid_rows.contains(row as u32) {
            FeatureValue::Null
        } else {
            self.cells.get(row)
        }
    }

    pub fn value_type_of(&self, row: usize) -> FeatureValueType {
        if self.invalid_rows.contains(row as u32) {
            FeatureValueType::Invalid
        } else {
            self.cells.get(row).value_type()
        }
    }

    /// Ascending traversal of the numeric (or string-id) map, collecting
    /// every row whose value falls within `[lo, hi]` (or `(lo, hi)` if
    /// `inclusive` is false).
    pub fn find_rows_in_range(&self, lo: f64, hi: f64, inclusive: bool, out: &mut IntegerSet) {
        use std::ops::Bound::*;
        let (lo_b, hi_b) = if inclusive {
            (Included(NumKey(lo)), Included(NumKey(hi)))
        } else {
            (Excluded(NumKey(lo)), Excluded(NumKey(hi)))
        };
        for (_, rows) in self.numbers.range((lo_b, hi_b)) {
            out.union_with(rows);
        }
    }

    pub fn find_string_rows_in_range(
        &self,
        lo: StringId,
        hi: StringId,
        inclusive: bool,
        out: &mut IntegerSet,
    ) {
        use std::ops::Bound::*;
        let (lo_b, hi_b) = if inclusive {
            (Included(lo), Included(hi))
        } else {
            (Excluded(lo), Excluded(hi))
        };
        for (_, rows) in self.strings.range((lo_b, hi_b)) {
            out.union_with(rows);
        }
    }

    pub fn rows_equal_to_number(&self, n: f64) -> Option<&IntegerSet> {
        self.numbers.get(&NumKey(n))
    }

    pub fn rows_equal_to_string(&self, s: StringId) -> Option<&IntegerSet> {
        self.strings.get(&s)
    }

    /// Returns the `k` rows holding the extreme (max if `is_max`,
    /// else min) numeric value among `within` (or every numeric row if
    /// `within` is `None`). All rows tied at the k-th value are
    /// included, so the result may exceed `k`.
    pub fn find_min_max(&self, k: usize, is_max: bool, within: Option<&IntegerSet>) -> IntegerSet {
        let mut out = IntegerSet::new();
        if k == 0 {
            return out;
        }
        let mut accepted_rows = 0usize;
        let iter: Box<dyn Iterator<Item = (&NumKey, &IntegerSet)>> = if is_max {
            Box::new(self.numbers.iter().rev())
        } else {
            Box::new(self.numbers.iter())
        };
        for (_, rows) in iter {
            let matching: Vec<u32> = match within {
                Some(w) => rows.iter().filter(|r| w.contains(*r)).collect(),
                None => rows.iter().collect(),
            };
            if matching.is_empty() {
                continue;
            }
            for r in matching {
                out.insert(r);
            }
            accepted_rows += 1;
            if accepted_rows >= k {
                break;
            }
        }
        out
    }

    /// O(log n) lookup of the closest numeric value to `target`, used by
    /// the nearest-neighbor populate-partial-sums pass (§4.5.1). For
    /// cyclic features, checks both neighbors modulo `cycle_length`.
    pub fn closest_value_entry_for(
        &self,
        target: f64,
        cycle_length: Option<f64>,
    ) -> Option<(f64, &IntegerSet)> {
        use std::ops::Bound::*;
        let lower = self
            .numbers
            .range((Unbounded, Included(NumKey(target))))
            .next_back();
        let upper = self
            .numbers
            .range((Excluded(NumKey(target)), Unbounded))
            .next();

        let dist = |v: f64| -> f64 {
            let d = (v - target).abs();
            match cycle_length {
                Some(c) if c > 0.0 => d.min(c - d),
                _ => d,
            }
        };

        match (lower, upper) {
            (Some((lk, lset)), Some((uk, uset))) => {
                if dist(lk.0) <= dist(uk.0) {
                    Some((lk.0, lset))
                } else {
                    Some((uk.0, uset))
                }
            }
            (Some((lk, lset)), None) => Some((lk.0, lset)),
            (None, Some((uk, uset))) => Some((uk.0, uset)),
            (None, None) => None,
        }
    }

    /// Iterates numeric buckets outward from `target`, alternating
    /// lower/upper (wrapping for cyclic features), used by
    /// populate-partial-sums-with-similar-values (§4.5.1).
    pub fn numeric_buckets_outward(
        &self,
        target: f64,
        cycle_length: Option<f64>,
    ) -> impl Iterator<Item = (f64, &IntegerSet)> + '_ {
        NumericOutwardIter::new(self, target, cycle_length)
    }

    pub fn unique_value_count(&self, t: FeatureValueType) -> usize {
        match t {
            FeatureValueType::Number => self.numbers.len(),
            FeatureValueType::StringId => self.strings.len(),
            FeatureValueType::Code => self.codes_by_size.len(),
            FeatureValueType::Null => {
                if self.null_rows.is_empty() {
                    0
                } else {
                    1
                }
            }
            FeatureValueType::Invalid => {
                if self.invalid_rows.is_empty() {
                    0
                } else {
                    1
                }
            }
        }
    }

    fn distinct_value_count(&self) -> usize {
        self.numbers.len() + self.strings.len()
    }

    /// Decides whether to intern or un-intern this column's storage
    /// based on the quadratic heuristic in spec.md §3: intern when
    /// `#distinct <= sqrt(2 * #rows)`. Idempotent — calling twice in a
    /// row is a no-op the second time.
    pub fn optimize_column(&mut self) {
        let threshold = (2.0 * self.num_rows as f64).sqrt();
        let should_intern = (self.distinct_value_count() as f64) <= threshold && self.num_rows > 0;

        match (&self.cells, should_intern) {
            (Cells::Direct(_), true) => self.convert_to_interned(),
            (Cells::Interned { .. }, false) => self.convert_to_direct(),
            _ => {}
        }
    }

    fn convert_to_interned(&mut self) {
        let values: Vec<FeatureValue> = if let Cells::Direct(v) = &self.cells {
            v.clone()
        } else {
            return;
        };
        let mut table = Vec::new();
        let mut lookup_num = HashMap::new();
        let mut lookup_str = HashMap::new();
        let mut indices = Vec::with_capacity(values.len());
        for v in values {
            indices.push(intern_lookup_or_insert(
                &mut table,
                &mut lookup_num,
                &mut lookup_str,
                &v,
            ));
        }
        self.cells = Cells::Interned {
            indices,
            table,
            lookup_num,
            lookup_str,
        };
    }

    fn convert_to_direct(&mut self) {
        let values: Vec<FeatureValue> = (0..self.cells.len()).map(|r| self.cells.get(r)).collect();
        self.cells = Cells::Direct(values);
    }

    #[cfg(test)]
    fn is_interned(&self) -> bool {
        matches!(self.cells, Cells::Interned { .. })
    }
}

struct NumericOutwardIter<'a> {
    column: &'a ColumnData,
    cycle_length: Option<f64>,
    target: f64,
    lower: Option<NumKey>,
    upper: Option<NumKey>,
    next_is_lower: bool,
}

impl<'a> NumericOutwardIter<'a> {
    fn new(column: &'a ColumnData, target: f64, cycle_length: Option<f64>) -> Self {
        use std::ops::Bound::*;
        let lower = column
            .numbers
            .range((Unbounded, Excluded(NumKey(target))))
            .next_back()
            .map(|(k, _)| *k);
        let upper = column
            .numbers
            .range((Excluded(NumKey(target)), Unbounded))
            .next()
            .map(|(k, _)| *k);
        NumericOutwardIter {
            column,
            cycle_length,
            target,
            lower,
            upper,
            next_is_lower: true,
        }
    }

    fn dist(&self, v: f64) -> f64 {
        let d = (v - self.target).abs();
        match self.cycle_length {
            Some(c) if c > 0.0 => d.min(c - d),
            _ => d,
        }
    }
}

impl<'a> Iterator for NumericOutwardIter<'a> {
    type Item = (f64, &'a IntegerSet);

    fn next(&mut self) -> Option<Self::Item> {
        use std::ops::Bound::*;
        let take_lower = match (self.lower, self.upper) {
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
            (Some(l), Some(u)) => {
                if self.next_is_lower {
                    self.dist(l.0) <= self.dist(u.0)
                } else {
                    !(self.dist(u.0) <= self.dist(l.0))
                }
            }
        };
        self.next_is_lower = !self.next_is_lower;

        if take_lower {
            let k = self.lower.unwrap();
            let rows = self.column.numbers.get(&k).unwrap();
            self.lower = self
                .column
                .numbers
                .range((Unbounded, Excluded(k)))
                .next_back()
                .map(|(k2, _)| *k2);
            Some((k.0, rows))
        } else {
            let k = self.upper.unwrap();
            let rows = self.column.numbers.get(&k).unwrap();
            self.upper = self
                .column
                .numbers
                .range((Excluded(k), Unbounded))
                .next()
                .map(|(k2, _)| *k2);
            Some((k.0, rows))
        }
    }
}
