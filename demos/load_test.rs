//! ```bash
//! RUSTFLAGS="-C target-cpu=native" cargo run --example load_test --release
//! ```

use rand::{rngs::StdRng, Rng, SeedableRng};
use sbfds::{DistanceEvaluator, FeatureAttributes, FeatureValue, IntegerSet, SbfdsStore, StoreConfig};
use std::collections::HashMap;
use std::time::Instant;

/// Number of entities to generate for the load test
const N_ENTITIES: usize = 10_000;
/// Number of features per entity
const N_FEATURES: usize = 16;
/// Number of nearest-neighbor queries to run for verification
const N_QUERIES: usize = 100;
/// `top_k` for each nearest-neighbor query
const TOP_K: usize = 10;
/// Deterministic seed for reproducibility
const SEED: u64 = 42;

fn random_row(rng: &mut StdRng, n_features: usize) -> Vec<f64> {
    (0..n_features).map(|_| rng.gen::<f64>() * 2.0 - 1.0).collect()
}

fn divider() {
    println!("{}", "─".repeat(60));
}

fn main() -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║       sbfds Load Test — SBFDS Nearest-Neighbor Bench      ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    // ── Phase 1: Data Generation ─────────────────────────────────────────────
    divider();
    println!("Phase 1 — Generating random rows");
    println!("  Entities: {N_ENTITIES}");
    println!("  Features: {N_FEATURES}");

    let t0 = Instant::now();
    let mut rng = StdRng::seed_from_u64(SEED);
    let rows: Vec<Vec<f64>> = (0..N_ENTITIES).map(|_| random_row(&mut rng, N_FEATURES)).collect();
    println!("  Generated in {:?}", t0.elapsed());

    // ── Phase 2: Insertion ────────────────────────────────────────────────────
    divider();
    println!("Phase 2 — Inserting into SbfdsStore");

    let store = SbfdsStore::new(StoreConfig::default());
    let labels: Vec<String> = (0..N_FEATURES).map(|i| format!("f{i}")).collect();
    store.add_labels(&labels);
    let label_ids: Vec<_> = labels.iter().map(|l| store.label_id(l).unwrap()).collect();

    let t0 = Instant::now();
    for row in &rows {
        let mut values = HashMap::with_capacity(N_FEATURES);
        for (id, &v) in label_ids.iter().zip(row.iter()) {
            values.insert(*id, FeatureValue::Number(v));
        }
        store.add_entity(&values);
    }
    let insert_duration = t0.elapsed();
    println!("  Inserted {N_ENTITIES} entities in {insert_duration:?}");
    println!(
        "  Throughput: {:.0} entities/sec",
        N_ENTITIES as f64 / insert_duration.as_secs_f64()
    );

    // ── Phase 3: Nearest-Neighbor Queries ─────────────────────────────────────
    divider();
    println!("Phase 3 — Running {N_QUERIES} nearest-neighbor queries (top_k={TOP_K})");

    let features: Vec<FeatureAttributes> = (0..N_FEATURES)
        .map(|_| FeatureAttributes::continuous(1.0, 0.0, 2.0))
        .collect();
    let eval = DistanceEvaluator::new(features, 2.0)?;
    let candidates = IntegerSet::full_range(N_ENTITIES as u32);

    let mut query_rng = StdRng::seed_from_u64(SEED + 1);
    let queries: Vec<Vec<f64>> = (0..N_QUERIES)
        .map(|_| random_row(&mut query_rng, N_FEATURES))
        .collect();

    let t0 = Instant::now();
    let mut total_found = 0usize;
    for q in &queries {
        let values: Vec<FeatureValue> = q.iter().map(|&v| FeatureValue::Number(v)).collect();
        let result = store.find_nearest_rows(
            &eval,
            &label_ids,
            &values,
            TOP_K,
            None,
            &candidates,
            None,
            false,
            &mut query_rng,
        );
        total_found += result.len();
    }
    let search_duration = t0.elapsed();

    println!("  Completed in {search_duration:?}");
    println!(
        "  Average per query: {:.2} µs",
        search_duration.as_micros() as f64 / N_QUERIES as f64
    );
    println!("  Average neighbors returned: {:.1}", total_found as f64 / N_QUERIES as f64);

    // ── Phase 4: Within-Distance Query ───────────────────────────────────────
    divider();
    println!("Phase 4 — Within-distance query against the first row");

    let origin: Vec<FeatureValue> = rows[0].iter().map(|&v| FeatureValue::Number(v)).collect();
    let t0 = Instant::now();
    let within = store.find_entities_within_distance(&eval, &label_ids, &origin, 1.0, None, &candidates);
    let within_duration = t0.elapsed();
    println!("  Found {} entities within distance 1.0 in {:?}", within.len(), within_duration);

    // ── Summary ───────────────────────────────────────────────────────────────
    divider();
    println!("Performance Summary");
    println!("──────────────────────────────────────────────────");
    println!(
        "  Insert throughput:   {:.0} entities/s",
        N_ENTITIES as f64 / insert_duration.as_secs_f64()
    );
    println!(
        "  KNN latency (avg):   {:.2} µs/query ({N_ENTITIES} entities, {N_FEATURES} features)",
        search_duration.as_micros() as f64 / N_QUERIES as f64
    );
    println!("──────────────────────────────────────────────────");

    Ok(())
}
