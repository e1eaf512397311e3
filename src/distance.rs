//! C3 — `DistanceEvaluator`: per-feature distance parameters and term
//! computation under a generalized Minkowski metric.
//!
//! A query carries one evaluator shared by every feature it touches.
//! Each feature has its own *kind* (nominal vs. continuous, and the
//! value domain: numeric / string / code, plus a cyclic flag for
//! numerics), its own weight and smoothing deviation, and its own
//! missing-value policy (`known_to_unknown` / `unknown_to_unknown`
//! terms). The evaluator itself carries one shared Minkowski exponent
//! `p`: `exponentiated distance = Σᵢ wᵢ · |aᵢ − bᵢ|^p`, rooted back with
//! `p`-th root once accumulation finishes.

use crate::error::{Result, SbfdsError};
use crate::value::{FeatureValue, StringId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves an interned string id to its text, for the one feature kind
/// that needs actual string content rather than identity comparison.
/// The intern pool itself lives outside this crate (spec.md §5); this
/// trait is the seam.
pub trait StringResolver: Send + Sync {
    fn resolve(&self, id: StringId) -> Cow<'_, str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    NominalNumeric,
    NominalString,
    NominalCode,
    ContinuousNumeric,
    ContinuousNumericCyclic,
    ContinuousString,
    ContinuousCode,
}

impl FeatureKind {
    fn is_cyclic(self) -> bool {
        matches!(self, FeatureKind::ContinuousNumericCyclic)
    }

    fn is_nominal(self) -> bool {
        matches!(
            self,
            FeatureKind::NominalNumeric | FeatureKind::NominalString | FeatureKind::NominalCode
        )
    }
}

/// A hashable stand-in for a `FeatureValue`, used as the key of a
/// nominal per-value term-override table. Code values can't usefully
/// key a hash table (their identity is deep structural equality), so
/// overrides are only meaningful for number/string-id nominal features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NominalKey {
    Number(u64),
    StringId(StringId),
}

impl NominalKey {
    fn from_value(v: &FeatureValue) -> Option<Self> {
        match v {
            FeatureValue::Number(n) if !n.is_nan() => Some(NominalKey::Number(n.to_bits())),
            FeatureValue::StringId(s) => Some(NominalKey::StringId(*s)),
            _ => None,
        }
    }
}

/// Per-value term overrides for a nominal-asymmetric feature: a table
/// keyed by value giving (match-term, non-match-term), falling back to
/// deviation-derived defaults when a value has no explicit entry.
#[derive(Debug, Clone, Default)]
pub struct NominalTermTable {
    match_terms: HashMap<NominalKey, f64>,
    non_match_terms: HashMap<NominalKey, f64>,
}

impl NominalTermTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_match_term(&mut self, value: &FeatureValue, term: f64) {
        if let Some(k) = NominalKey::from_value(value) {
            self.match_terms.insert(k, term);
        }
    }

    pub fn set_non_match_term(&mut self, value: &FeatureValue, term: f64) {
        if let Some(k) = NominalKey::from_value(value) {
            self.non_match_terms.insert(k, term);
        }
    }

    fn match_term_for(&self, value: &FeatureValue) -> Option<f64> {
        NominalKey::from_value(value).and_then(|k| self.match_terms.get(&k).copied())
    }

    fn non_match_term_for(&self, value: &FeatureValue) -> Option<f64> {
        NominalKey::from_value(value).and_then(|k| self.non_match_terms.get(&k).copied())
    }
}

/// Per-feature distance parameters.
#[derive(Clone)]
pub struct FeatureAttributes {
    pub kind: FeatureKind,
    /// Zero disables the feature; the data store strips zero-weight
    /// features from a query before it ever reaches the evaluator.
    pub weight: f64,
    /// Smoothing deviation for sparse differences. NaN means "none".
    pub deviation: f64,
    /// Cost of comparing a known value against a missing one. NaN
    /// defaults to `maximum_difference_for_feature`.
    pub known_to_unknown: f64,
    /// Cost of comparing two missing values. NaN defaults likewise.
    pub unknown_to_unknown: f64,
    /// Cycle length for `ContinuousNumericCyclic`; ignored otherwise.
    pub cycle_length: f64,
    /// Upper bound on this feature's raw (pre-exponentiated)
    /// difference, used to resolve NaN known/unknown-to-unknown terms
    /// and to bound cyclic distances. For continuous-numeric this is
    /// normally the column's observed max-min span.
    pub max_difference: f64,
    /// Optional asymmetric nominal overrides (number/string-id only).
    pub nominal_overrides: Option<NominalTermTable>,
    /// Precomputed symmetric non-match term for nominal features with
    /// no per-value table: all distinct-value pairs cost this.
    pub nominal_non_match_term: f64,
    /// String resolver, required for `ContinuousString` features only.
    pub string_resolver: Option<Arc<dyn StringResolver>>,
}

impl FeatureAttributes {
    pub fn symmetric_nominal(kind: FeatureKind, weight: f64, non_match_term: f64) -> Self {
        FeatureAttributes {
            kind,
            weight,
            deviation: f64::NAN,
            known_to_unknown: f64::NAN,
            unknown_to_unknown: f64::NAN,
            cycle_length: f64::NAN,
            max_difference: non_match_term,
            nominal_overrides: None,
            nominal_non_match_term: non_match_term,
            string_resolver: None,
        }
    }

    pub fn continuous(weight: f64, deviation: f64, max_difference: f64) -> Self {
        FeatureAttributes {
            kind: FeatureKind::ContinuousNumeric,
            weight,
            deviation,
            known_to_unknown: f64::NAN,
            unknown_to_unknown: f64::NAN,
            cycle_length: f64::NAN,
            max_difference,
            nominal_overrides: None,
            nominal_non_match_term: f64::NAN,
            string_resolver: None,
        }
    }

    pub fn cyclic(weight: f64, deviation: f64, cycle_length: f64) -> Self {
        FeatureAttributes {
            kind: FeatureKind::ContinuousNumericCyclic,
            weight,
            deviation,
            known_to_unknown: f64::NAN,
            unknown_to_unknown: f64::NAN,
            cycle_length,
            max_difference: cycle_length / 2.0,
            nominal_overrides: None,
            nominal_non_match_term: f64::NAN,
            string_resolver: None,
        }
    }

    fn effective(&self, term: f64, max_diff: f64) -> f64 {
        if term.is_nan() {
            max_diff
        } else {
            term
        }
    }

    fn effective_known_to_unknown(&self) -> f64 {
        self.effective(self.known_to_unknown, self.max_difference)
    }

    fn effective_unknown_to_unknown(&self) -> f64 {
        self.effective(self.unknown_to_unknown, self.max_difference)
    }

    fn apply_deviation(&self, diff: f64) -> f64 {
        if self.deviation.is_nan() || self.deviation <= 0.0 {
            diff
        } else {
            (diff - self.deviation).max(0.0)
        }
    }
}

/// Shared distance parameters for one query: one [`FeatureAttributes`]
/// per active feature, plus the Minkowski exponent they share.
pub struct DistanceEvaluator {
    features: Vec<FeatureAttributes>,
    p: f64,
}

impl DistanceEvaluator {
    /// `p` must be a strictly positive real (or `f64::INFINITY`); a
    /// p-value of 0 is only meaningful for cache-backed queries to
    /// reject explicitly (see [`SbfdsError::InvalidMinkowskiExponent`]).
    pub fn new(features: Vec<FeatureAttributes>, p: f64) -> Result<Self> {
        if !(p > 0.0) {
            return Err(SbfdsError::InvalidMinkowskiExponent(p));
        }
        Ok(DistanceEvaluator { features, p })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn feature(&self, i: usize) -> &FeatureAttributes {
        &self.features[i]
    }

    pub fn weight(&self, i: usize) -> f64 {
        self.features[i].weight
    }

    /// The largest raw (pre-exponentiated, pre-weight) difference this
    /// feature can produce; used to resolve NaN known/unknown-to-unknown
    /// defaults and as the uncomputed-feature upper bound during pruning.
    pub fn maximum_difference_for_feature(&self, i: usize) -> f64 {
        let f = &self.features[i];
        if f.kind.is_nominal() {
            f.nominal_overrides
                .as_ref()
                .map(|t| {
                    t.non_match_terms
                        .values()
                        .cloned()
                        .fold(f.nominal_non_match_term, f64::max)
                })
                .unwrap_or(f.nominal_non_match_term)
        } else {
            f.max_difference
        }
    }

    /// Raises a raw difference to the shared Minkowski power. Fast
    /// paths cover the common exponents; `high_accuracy` selects
    /// `f64::powf` over a cheaper single-precision approximation (the
    /// latter is acceptable mid-search, the former for final results).
    pub fn exponentiate_term(&self, diff: f64, high_accuracy: bool) -> f64 {
        debug_assert!(diff >= 0.0 || diff.is_nan());
        if diff.is_nan() {
            return f64::NAN;
        }
        if self.p == f64::INFINITY {
            return diff;
        }
        if diff == 0.0 {
            return 0.0;
        }
        match self.p {
            p if p == 1.0 => diff,
            p if p == 2.0 => diff * diff,
            p if p == 0.5 => diff.sqrt(),
            p if high_accuracy => diff.powf(p),
            p => (diff as f32).powf(p as f32) as f64,
        }
    }

    /// Inverts accumulation: turns a summed exponentiated distance back
    /// into a rooted distance via the `1/p`-th power (identity for
    /// `p = ∞`, where accumulation is already a running max).
    pub fn inverse_exponentiate_sum(&self, sum: f64, high_accuracy: bool) -> f64 {
        if sum.is_nan() || self.p == f64::INFINITY {
            return sum;
        }
        if sum == 0.0 {
            return 0.0;
        }
        match self.p {
            p if p == 1.0 => sum,
            p if p == 2.0 => sum.sqrt(),
            p => {
                let inv = 1.0 / p;
                if high_accuracy {
                    sum.powf(inv)
                } else {
                    (sum as f32).powf(inv as f32) as f64
                }
            }
        }
    }

    /// Computes the raw (pre-exponentiated) difference between two
    /// values of feature `i`, applying this feature's missing-value
    /// and smoothing policy. The caller exponentiates and weights the
    /// result separately (see `weighted_exponentiated_term`).
    pub fn raw_term(&self, i: usize, a: &FeatureValue, b: &FeatureValue) -> f64 {
        let f = &self.features[i];
        let a_null = a.is_null();
        let b_null = b.is_null();

        if a_null && b_null {
            return f.effective_unknown_to_unknown();
        }
        if a_null || b_null {
            return f.effective_known_to_unknown();
        }

        match f.kind {
            FeatureKind::NominalNumeric | FeatureKind::NominalString | FeatureKind::NominalCode => {
                self.nominal_term(f, a, b)
            }
            FeatureKind::ContinuousNumeric => {
                let (x, y) = (a.as_number().unwrap_or(f64::NAN), b.as_number().unwrap_or(f64::NAN));
                if x.is_nan() || y.is_nan() {
                    return f.effective_known_to_unknown();
                }
                f.apply_deviation((x - y).abs())
            }
            FeatureKind::ContinuousNumericCyclic => {
                let (x, y) = (a.as_number().unwrap_or(f64::NAN), b.as_number().unwrap_or(f64::NAN));
                if x.is_nan() || y.is_nan() {
                    return f.effective_known_to_unknown();
                }
                let raw = (x - y).abs();
                let wrapped = (f.cycle_length - raw).max(0.0);
                f.apply_deviation(raw.min(wrapped))
            }
            FeatureKind::ContinuousString => self.string_continuous_term(f, a, b),
            FeatureKind::ContinuousCode => self.code_continuous_term(f, a, b),
        }
    }

    fn nominal_term(&self, f: &FeatureAttributes, a: &FeatureValue, b: &FeatureValue) -> f64 {
        let is_match = a == b;
        if let Some(table) = &f.nominal_overrides {
            // Asymmetric: look up each side independently, preferring
            // the value-specific override and falling back to the
            // feature-wide default.
            if is_match {
                table
                    .match_term_for(a)
                    .unwrap_or_else(|| f.apply_deviation(0.0))
            } else {
                table
                    .non_match_term_for(a)
                    .or_else(|| table.non_match_term_for(b))
                    .unwrap_or(f.nominal_non_match_term)
            }
        } else if is_match {
            f.apply_deviation(0.0)
        } else {
            f.nominal_non_match_term
        }
    }

    fn string_continuous_term(&self, f: &FeatureAttributes, a: &FeatureValue, b: &FeatureValue) -> f64 {
        let (Some(ia), Some(ib)) = (a.as_string_id(), b.as_string_id()) else {
            return f.effective_known_to_unknown();
        };
        if ia == ib {
            return f.apply_deviation(0.0);
        }
        let resolver = f
            .string_resolver
            .as_ref()
            .expect("ContinuousString feature configured without a StringResolver");
        let sa = resolver.resolve(ia);
        let sb = resolver.resolve(ib);
        f.apply_deviation(normalized_edit_distance(&sa, &sb))
    }

    fn code_continuous_term(&self, f: &FeatureAttributes, a: &FeatureValue, b: &FeatureValue) -> f64 {
        let (Some(ca), Some(cb)) = (a.as_code(), b.as_code()) else {
            return f.effective_known_to_unknown();
        };
        if ca.deep_eq(cb.as_ref()) {
            return 0.0;
        }
        // The core never walks the evaluable tree itself (spec: code
        // values are non-owning, deep-size/deep-eq only), so tree edit
        // distance is approximated by the difference in subtree size.
        (ca.deep_size() as f64 - cb.deep_size() as f64).abs()
    }

    /// `weight * ExponentiateTerm(raw_term)` — the quantity accumulated
    /// into a [`crate::partial_sum::PartialSumCollection`] row.
    pub fn weighted_exponentiated_term(
        &self,
        i: usize,
        a: &FeatureValue,
        b: &FeatureValue,
        high_accuracy: bool,
    ) -> f64 {
        let raw = self.raw_term(i, a, b);
        self.features[i].weight * self.exponentiate_term(raw, high_accuracy)
    }
}

/// Levenshtein distance normalized by the longer string's length, so
/// the result lands in `[0, 1]` regardless of string size.
fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let edits = prev[b.len()];
    edits as f64 / a.len().max(b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_single(f: FeatureAttributes, p: f64) -> DistanceEvaluator {
        DistanceEvaluator::new(vec![f], p).unwrap()
    }

    #[test]
    fn rejects_nonpositive_p() {
        let f = FeatureAttributes::continuous(1.0, f64::NAN, 1.0);
        assert!(DistanceEvaluator::new(vec![f.clone()], 0.0).is_err());
        assert!(DistanceEvaluator::new(vec![f], -1.0).is_err());
    }

    #[test]
    fn continuous_distance_is_symmetric() {
        let ev = eval_single(FeatureAttributes::continuous(1.0, f64::NAN, 10.0), 2.0);
        let a = FeatureValue::Number(3.0);
        let b = FeatureValue::Number(7.0);
        assert_eq!(ev.raw_term(0, &a, &b), ev.raw_term(0, &b, &a));
        assert_eq!(ev.raw_term(0, &a, &b), 4.0);
    }

    #[test]
    fn deviation_smooths_small_differences_to_zero() {
        let ev = eval_single(FeatureAttributes::continuous(1.0, 2.0, 10.0), 2.0);
        let a = FeatureValue::Number(3.0);
        let b = FeatureValue::Number(4.0);
        assert_eq!(ev.raw_term(0, &a, &b), 0.0);
    }

    #[test]
    fn cyclic_distance_never_exceeds_half_the_cycle() {
        let ev = eval_single(FeatureAttributes::cyclic(1.0, f64::NAN, 5.0), 2.0);
        let a = FeatureValue::Number(0.0);
        let b = FeatureValue::Number(4.0);
        let d = ev.raw_term(0, &a, &b);
        assert!(d <= 2.5 + 1e-9);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn nominal_symmetric_matches_emit_zero_and_nonmatches_the_fixed_term() {
        let ev = eval_single(
            FeatureAttributes::symmetric_nominal(FeatureKind::NominalString, 1.0, 1.0),
            2.0,
        );
        let a = FeatureValue::StringId(1);
        let b = FeatureValue::StringId(1);
        let c = FeatureValue::StringId(2);
        assert_eq!(ev.raw_term(0, &a, &b), 0.0);
        assert_eq!(ev.raw_term(0, &a, &c), 1.0);
    }

    #[test]
    fn unknown_terms_default_to_maximum_difference_when_nan() {
        let ev = eval_single(FeatureAttributes::continuous(1.0, f64::NAN, 7.0), 2.0);
        let a = FeatureValue::Number(1.0);
        let n = FeatureValue::Null;
        assert_eq!(ev.raw_term(0, &a, &n), 7.0);
        assert_eq!(ev.raw_term(0, &n, &n), 7.0);
    }

    #[test]
    fn exponentiate_and_invert_round_trip_for_euclidean() {
        let ev = eval_single(FeatureAttributes::continuous(1.0, f64::NAN, 7.0), 2.0);
        let e = ev.exponentiate_term(3.0, true);
        assert_eq!(e, 9.0);
        let back = ev.inverse_exponentiate_sum(e, true);
        assert!((back - 3.0).abs() < 1e-9);
    }

    #[test]
    fn infinite_p_takes_the_raw_difference_unmodified() {
        let ev = eval_single(FeatureAttributes::continuous(1.0, f64::NAN, 7.0), f64::INFINITY);
        assert_eq!(ev.exponentiate_term(4.0, true), 4.0);
        assert_eq!(ev.inverse_exponentiate_sum(4.0, true), 4.0);
    }

    #[test]
    fn asymmetric_nominal_overrides_take_priority_over_defaults() {
        let mut f = FeatureAttributes::symmetric_nominal(FeatureKind::NominalString, 1.0, 1.0);
        let mut table = NominalTermTable::new();
        table.set_non_match_term(&FeatureValue::StringId(5), 0.25);
        f.nominal_overrides = Some(table);
        let ev = eval_single(f, 2.0);
        let a = FeatureValue::StringId(5);
        let b = FeatureValue::StringId(9);
        assert_eq!(ev.raw_term(0, &a, &b), 0.25);
    }

    #[test]
    fn string_continuous_uses_normalized_edit_distance() {
        struct Fixed;
        impl StringResolver for Fixed {
            fn resolve(&self, id: StringId) -> Cow<'_, str> {
                match id {
                    1 => Cow::Borrowed("kitten"),
                    _ => Cow::Borrowed("sitting"),
                }
            }
        }
        let mut f = FeatureAttributes::continuous(1.0, f64::NAN, 1.0);
        f.kind = FeatureKind::ContinuousString;
        f.string_resolver = Some(Arc::new(Fixed));
        let ev = eval_single(f, 2.0);
        let a = FeatureValue::StringId(1);
        let b = FeatureValue::StringId(2);
        let d = ev.raw_term(0, &a, &b);
        assert!((d - 3.0 / 7.0).abs() < 1e-9);
    }
}
