//! Property tests for the store-level invariants listed in spec.md §8,
//! plus its six concrete end-to-end scenarios as fixed regression tests.

use proptest::collection::vec as pvec;
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use sbfds::{DistanceEvaluator, FeatureAttributes, FeatureValue, IntegerSet, SbfdsStore, StoreConfig};
use std::collections::{HashMap, HashSet};

fn single_continuous_store(values: &[f64]) -> (SbfdsStore, DistanceEvaluator, usize) {
    let store = SbfdsStore::new(StoreConfig::default());
    store.add_labels(&["x".to_string()]);
    let label = store.label_id("x").unwrap();
    for &v in values {
        let mut row = HashMap::new();
        row.insert(label, FeatureValue::Number(v));
        store.add_entity(&row);
    }
    let eval = DistanceEvaluator::new(vec![FeatureAttributes::continuous(1.0, 0.0, 1.0)], 2.0).unwrap();
    (store, eval, label)
}

proptest! {
    /// For every column, the five row-sets partition `0..numRows` exactly —
    /// spec.md §8's first structural invariant, exercised by insert/update
    /// sequences mixing numbers and nulls.
    #[test]
    fn column_row_sets_partition_every_row(
        values in pvec(prop_oneof![
            Just(FeatureValue::Null),
            (-1000.0f64..1000.0).prop_map(FeatureValue::Number),
        ], 0..64)
    ) {
        let store = SbfdsStore::new(StoreConfig::default());
        store.add_labels(&["x".to_string()]);
        let label = store.label_id("x").unwrap();
        for v in &values {
            let mut row = HashMap::new();
            row.insert(label, v.clone());
            store.add_entity(&row);
        }
        prop_assert!(store.verify_all_entities_for_all_columns());
    }

    /// `FindAllWithinRange(L, value, value, inclusive=true)` contains `r`
    /// iff row `r`'s value at `L` equals `value`.
    #[test]
    fn exact_range_matches_equality(
        values in pvec(-50.0f64..50.0, 1..40),
        target_idx in 0usize..40,
    ) {
        let target_idx = target_idx % values.len().max(1);
        let (store, _eval, label) = single_continuous_store(&values);
        let target = values[target_idx.min(values.len() - 1)];

        let matched: HashSet<usize> = store.find_all_within_range(label, target, target, true).iter().map(|r| r as usize).collect();
        let expected: HashSet<usize> = values.iter().enumerate().filter(|(_, &v)| v == target).map(|(i, _)| i).collect();
        prop_assert_eq!(matched, expected);
    }

    /// `AddEntity` then `RemoveEntity` (swap-pop) then `AddEntity` again
    /// preserves the multiset of (label, value) tuples of the surviving
    /// rows, modulo the row renumbering swap-pop performs.
    #[test]
    fn add_remove_add_preserves_remaining_values(
        values in pvec(-50.0f64..50.0, 2..30),
        remove_idx in 0usize..30,
    ) {
        let (store, _eval, label) = single_continuous_store(&values);
        let remove_idx = remove_idx % values.len();

        let mut expected: Vec<f64> = values.clone();
        expected.swap_remove(remove_idx);

        store.remove_entity(remove_idx).unwrap();

        let mut row = HashMap::new();
        row.insert(label, FeatureValue::Number(999.0));
        store.add_entity(&row);
        expected.push(999.0);

        let mut actual = Vec::with_capacity(expected.len());
        for r in 0..expected.len() {
            actual.push(store.get_value(r, label).unwrap().as_number().unwrap());
        }

        let mut expected_sorted = expected.clone();
        let mut actual_sorted = actual.clone();
        expected_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        actual_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        prop_assert_eq!(expected_sorted, actual_sorted);
    }

    /// Increasing `max_dist` never removes a row from a within-distance
    /// result set.
    #[test]
    fn within_distance_monotonic_in_max_dist(
        values in pvec(-20.0f64..20.0, 1..30),
        target in -20.0f64..20.0,
        d1 in 0.0f64..5.0,
        d2 in 0.0f64..5.0,
    ) {
        let (store, eval, label) = single_continuous_store(&values);
        let (lo, hi) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
        let all = IntegerSet::full_range(values.len() as u32);
        let query = vec![FeatureValue::Number(target)];

        let small: HashSet<usize> = store
            .find_entities_within_distance(&eval, &[label], &query, lo, None, &all)
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let large: HashSet<usize> = store
            .find_entities_within_distance(&eval, &[label], &query, hi, None, &all)
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        prop_assert!(small.is_subset(&large));
    }

    /// Increasing `top_k` never removes a row from a nearest-neighbor
    /// result set.
    #[test]
    fn nearest_monotonic_in_top_k(
        values in pvec(-20.0f64..20.0, 3..30),
        target in -20.0f64..20.0,
        k1 in 1usize..10,
        k2 in 1usize..10,
    ) {
        let (store, eval, label) = single_continuous_store(&values);
        let (small_k, big_k) = if k1 <= k2 { (k1, k2) } else { (k2, k1) };
        let all = IntegerSet::full_range(values.len() as u32);
        let query = vec![FeatureValue::Number(target)];

        let mut rng = StdRng::seed_from_u64(7);
        let small: HashSet<usize> = store
            .find_nearest_rows(&eval, &[label], &query, small_k, None, &all, None, false, &mut rng)
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let mut rng = StdRng::seed_from_u64(7);
        let large: HashSet<usize> = store
            .find_nearest_rows(&eval, &[label], &query, big_k, None, &all, None, false, &mut rng)
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        prop_assert!(small.is_subset(&large));
    }

    /// Determinism: the same seed yields the same ordered result list for
    /// `FindNearestEntities`, even across repeated calls.
    #[test]
    fn nearest_deterministic_under_fixed_seed(
        values in pvec(-20.0f64..20.0, 3..30),
        target in -20.0f64..20.0,
        k in 1usize..10,
        seed in any::<u64>(),
    ) {
        let (store, eval, label) = single_continuous_store(&values);
        let all = IntegerSet::full_range(values.len() as u32);
        let query = vec![FeatureValue::Number(target)];

        let mut rng_a = StdRng::seed_from_u64(seed);
        let a = store.find_nearest_rows(&eval, &[label], &query, k, None, &all, None, false, &mut rng_a);
        let mut rng_b = StdRng::seed_from_u64(seed);
        let b = store.find_nearest_rows(&eval, &[label], &query, k, None, &all, None, false, &mut rng_b);
        prop_assert_eq!(a, b);
    }

    /// Symmetric-nominal distance is symmetric: swapping the two operands
    /// of `weighted_exponentiated_term` gives the same result.
    #[test]
    fn symmetric_nominal_is_symmetric(
        a in 0u32..5,
        b in 0u32..5,
    ) {
        use sbfds::distance::FeatureKind;
        let attrs = FeatureAttributes::symmetric_nominal(FeatureKind::NominalNumeric, 1.0, 1.0);
        let eval = DistanceEvaluator::new(vec![attrs], 2.0).unwrap();
        let va = FeatureValue::Number(a as f64);
        let vb = FeatureValue::Number(b as f64);
        let d_ab = eval.weighted_exponentiated_term(0, &va, &vb, true);
        let d_ba = eval.weighted_exponentiated_term(0, &vb, &va, true);
        prop_assert!((d_ab - d_ba).abs() < 1e-9);
    }

    /// Cyclic distance never exceeds half the cycle length.
    #[test]
    fn cyclic_distance_bounded_by_half_cycle(
        a in 0.0f64..100.0,
        b in 0.0f64..100.0,
        cycle in 1.0f64..100.0,
    ) {
        let attrs = FeatureAttributes::cyclic(1.0, 0.0, cycle);
        let eval = DistanceEvaluator::new(vec![attrs], 2.0).unwrap();
        let raw = eval.raw_term(0, &FeatureValue::Number(a), &FeatureValue::Number(b));
        prop_assert!(raw <= cycle / 2.0 + 1e-9);
    }
}

/// Scenario 1 (spec.md §8): right-triangle rows, nearest 2 to the origin.
#[test]
fn scenario_right_triangle_nearest_two() {
    let store = SbfdsStore::new(StoreConfig::default());
    store.add_labels(&["x".to_string(), "y".to_string()]);
    let (lx, ly) = (store.label_id("x").unwrap(), store.label_id("y").unwrap());
    for (x, y) in [(0.0, 0.0), (3.0, 4.0), (5.0, 12.0)] {
        let mut row = HashMap::new();
        row.insert(lx, FeatureValue::Number(x));
        row.insert(ly, FeatureValue::Number(y));
        store.add_entity(&row);
    }
    let eval = DistanceEvaluator::new(
        vec![FeatureAttributes::continuous(1.0, 0.0, 20.0), FeatureAttributes::continuous(1.0, 0.0, 20.0)],
        2.0,
    )
    .unwrap();
    let all = IntegerSet::full_range(3);
    let query = vec![FeatureValue::Number(0.0), FeatureValue::Number(0.0)];
    let mut rng = StdRng::seed_from_u64(1);
    let mut result = store.find_nearest_rows(&eval, &[lx, ly], &query, 2, None, &all, None, false, &mut rng);
    result.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].0, 0);
    assert!((result[0].1 - 0.0).abs() < 1e-9);
    assert_eq!(result[1].0, 1);
    assert!((result[1].1 - 5.0).abs() < 1e-9);
}

/// Scenario 3: nominal string column, within-distance(max_dist=0) keeps
/// only exact string matches.
#[test]
fn scenario_nominal_exact_match_within_zero() {
    use sbfds::distance::FeatureKind;
    let store = SbfdsStore::new(StoreConfig::default());
    store.add_labels(&["s".to_string()]);
    let label = store.label_id("s").unwrap();
    let ids = ["a", "b", "a", "c", "a"];
    for (i, _) in ids.iter().enumerate() {
        let mut row = HashMap::new();
        row.insert(label, FeatureValue::StringId(if ids[i] == "a" { 0 } else if ids[i] == "b" { 1 } else { 2 }));
        store.add_entity(&row);
    }
    let attrs = FeatureAttributes::symmetric_nominal(FeatureKind::NominalString, 1.0, 1.0);
    let eval = DistanceEvaluator::new(vec![attrs], 2.0).unwrap();
    let all = IntegerSet::full_range(5);
    let query = vec![FeatureValue::StringId(0)];
    let result = store.find_entities_within_distance(&eval, &[label], &query, 0.0, None, &all);
    let mut rows: Vec<usize> = result.into_iter().map(|(r, _)| r).collect();
    rows.sort();
    assert_eq!(rows, vec![0, 2, 4]);
}

/// Scenario 4: 100 uniform rows, per-row radius 0.1, within-distance 0 of
/// 0.5 keeps exactly the rows in (0.4, 0.6).
#[test]
fn scenario_uniform_radius_band() {
    let store = SbfdsStore::new(StoreConfig::default());
    store.add_labels(&["x".to_string(), "radius".to_string()]);
    let (lx, lr) = (store.label_id("x").unwrap(), store.label_id("radius").unwrap());
    let values: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
    for &v in &values {
        let mut row = HashMap::new();
        row.insert(lx, FeatureValue::Number(v));
        row.insert(lr, FeatureValue::Number(0.1));
        store.add_entity(&row);
    }
    let eval = DistanceEvaluator::new(vec![FeatureAttributes::continuous(1.0, 0.0, 1.0)], 2.0).unwrap();
    let all = IntegerSet::full_range(100);
    let query = vec![FeatureValue::Number(0.5)];
    let result = store.find_entities_within_distance(&eval, &[lx], &query, 0.0, Some(lr), &all);
    let mut rows: Vec<usize> = result.into_iter().map(|(r, _)| r).collect();
    rows.sort();
    let expected: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.4 && v < 0.6)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(rows, expected);
}

/// Scenario 6: two identical rows, nearest to one with the other as
/// holdout returns the self row at distance 0.
#[test]
fn scenario_identical_rows_self_at_zero() {
    let store = SbfdsStore::new(StoreConfig::default());
    store.add_labels(&["x".to_string()]);
    let label = store.label_id("x").unwrap();
    for _ in 0..2 {
        let mut row = HashMap::new();
        row.insert(label, FeatureValue::Number(3.0));
        store.add_entity(&row);
    }
    let eval = DistanceEvaluator::new(vec![FeatureAttributes::continuous(1.0, 0.0, 1.0)], 2.0).unwrap();
    let all = IntegerSet::full_range(2);
    let query = vec![FeatureValue::Number(3.0)];
    let mut rng = StdRng::seed_from_u64(3);
    let result = store.find_nearest_rows(&eval, &[label], &query, 1, None, &all, Some(1), false, &mut rng);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].0, 0);
    assert!((result[0].1 - 0.0).abs() < 1e-9);
}
