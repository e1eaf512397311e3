//! Run with:
//! ```bash
//! RUSTFLAGS="-C target-cpu=native" cargo bench --bench benchmark
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sbfds::{DistanceEvaluator, FeatureAttributes, FeatureValue, IntegerSet, SbfdsStore, StoreConfig};
use std::collections::HashMap;

/// Number of entities in the store for the main benchmarks.
const N_ENTITIES: usize = 10_000;
/// Number of continuous features per entity.
const N_FEATURES: usize = 16;
/// `top_k` used for the nearest-neighbor benchmarks.
const TOP_K: usize = 10;
/// Fixed RNG seed for reproducible benchmarks.
const SEED: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Generate `n` random rows of `n_features` continuous values.
/// A seeded RNG keeps benchmark data identical across runs, making
/// comparisons between runs statistically valid.
fn generate_random_rows(n: usize, n_features: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..n_features).map(|_| rng.gen::<f64>() * 2.0 - 1.0).collect())
        .collect()
}

/// Build an `SbfdsStore` pre-loaded with `n` random rows of `n_features`
/// continuous values, plus the distance evaluator and label list needed
/// to query it.
fn build_store(n: usize, n_features: usize) -> (SbfdsStore, DistanceEvaluator, Vec<usize>) {
    let store = SbfdsStore::new(StoreConfig::default());
    let labels: Vec<String> = (0..n_features).map(|i| format!("f{i}")).collect();
    store.add_labels(&labels);
    let label_ids: Vec<_> = labels.iter().map(|l| store.label_id(l).unwrap()).collect();

    let rows = generate_random_rows(n, n_features, SEED);
    for row in &rows {
        let mut values = HashMap::with_capacity(n_features);
        for (id, &v) in label_ids.iter().zip(row.iter()) {
            values.insert(*id, FeatureValue::Number(v));
        }
        store.add_entity(&values);
    }

    let features: Vec<FeatureAttributes> = (0..n_features)
        .map(|_| FeatureAttributes::continuous(1.0, 0.0, 2.0))
        .collect();
    let eval = DistanceEvaluator::new(features, 2.0).expect("p=2 is always valid");

    (store, eval, label_ids)
}

/// The pruning-search nearest-neighbor path: the partial-sum bookkeeping
/// and heap described in spec.md §4.5 against a 10,000-row, 16-feature
/// store.
fn bench_nearest_pruned(c: &mut Criterion) {
    let (store, eval, labels) = build_store(N_ENTITIES, N_FEATURES);
    let candidates = IntegerSet::full_range(N_ENTITIES as u32);
    let query = generate_random_rows(1, N_FEATURES, SEED + 1).remove(0);
    let values: Vec<FeatureValue> = query.iter().map(|&v| FeatureValue::Number(v)).collect();
    let mut rng = StdRng::seed_from_u64(SEED + 2);

    let mut group = c.benchmark_group("nearest_pruned");
    group.throughput(Throughput::Elements(N_ENTITIES as u64));

    group.bench_function(BenchmarkId::new("find_nearest_rows", format!("{N_ENTITIES}rows_dim{N_FEATURES}")), |b| {
        b.iter(|| {
            black_box(store.find_nearest_rows(
                &eval,
                &labels,
                black_box(&values),
                TOP_K,
                None,
                &candidates,
                None,
                false,
                &mut rng,
            ))
        })
    });

    group.finish();
}

/// Within-distance query: the incremental accumulate-then-prune loop of
/// spec.md §4.5's `FindRowsWithinDistance`.
fn bench_within_distance(c: &mut Criterion) {
    let (store, eval, labels) = build_store(N_ENTITIES, N_FEATURES);
    let candidates = IntegerSet::full_range(N_ENTITIES as u32);
    let query = generate_random_rows(1, N_FEATURES, SEED + 3).remove(0);
    let values: Vec<FeatureValue> = query.iter().map(|&v| FeatureValue::Number(v)).collect();

    let mut group = c.benchmark_group("within_distance");
    group.throughput(Throughput::Elements(N_ENTITIES as u64));

    group.bench_function(BenchmarkId::new("find_entities_within_distance", format!("{N_ENTITIES}rows")), |b| {
        b.iter(|| black_box(store.find_entities_within_distance(&eval, &labels, black_box(&values), 1.0, None, &candidates)))
    });

    group.finish();
}

/// How nearest-neighbor latency scales from 100 to 10,000 rows. Expected
/// to grow sub-linearly thanks to pruning; a linear or worse curve
/// indicates the partial-sum bounds aren't cutting candidates early.
fn bench_scaling(c: &mut Criterion) {
    let query = generate_random_rows(1, N_FEATURES, SEED + 4).remove(0);
    let values: Vec<FeatureValue> = query.iter().map(|&v| FeatureValue::Number(v)).collect();

    let mut group = c.benchmark_group("scaling_by_n_rows");
    for n in [100usize, 500, 1_000, 5_000, 10_000] {
        let (store, eval, labels) = build_store(n, N_FEATURES);
        let candidates = IntegerSet::full_range(n as u32);
        let mut rng = StdRng::seed_from_u64(SEED + 5);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _n| {
            b.iter(|| {
                black_box(store.find_nearest_rows(
                    &eval,
                    &labels,
                    black_box(&values),
                    TOP_K,
                    None,
                    &candidates,
                    None,
                    false,
                    &mut rng,
                ))
            })
        });
    }
    group.finish();
}

/// Single-row insertion throughput — bounds the index build rate for
/// live-ingestion workloads.
fn bench_add_entity(c: &mut Criterion) {
    let rows = generate_random_rows(1, N_FEATURES, SEED);
    let row = &rows[0];

    let mut group = c.benchmark_group("add_entity_throughput");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_single_entity", |b| {
        b.iter_batched(
            || {
                let store = SbfdsStore::new(StoreConfig::default());
                let labels: Vec<String> = (0..N_FEATURES).map(|i| format!("f{i}")).collect();
                store.add_labels(&labels);
                let label_ids: Vec<_> = labels.iter().map(|l| store.label_id(l).unwrap()).collect();
                (store, label_ids)
            },
            |(store, label_ids)| {
                let mut values = HashMap::with_capacity(N_FEATURES);
                for (id, &v) in label_ids.iter().zip(row.iter()) {
                    values.insert(*id, FeatureValue::Number(v));
                }
                store.add_entity(black_box(&values));
                store
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_nearest_pruned,
    bench_within_distance,
    bench_scaling,
    bench_add_entity,
);
criterion_main!(benches);
