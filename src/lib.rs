//! # sbfds — Separable Box-Filter Data Store
//!
//! The hard core of Amalgam's instance-based reasoning engine: a
//! columnar, mixed-type acceleration structure supporting exact match,
//! range, min/max, nearest-neighbor and within-radius queries under an
//! arbitrary (per-feature) generalized Minkowski distance, plus the
//! k-nearest-neighbor cache and the conviction / information-theoretic
//! queries layered on top of it (spec.md §1–§2).
//!
//! Seven cooperating components, leaves first:
//!
//! | Component | Module | Responsibility |
//! |---|---|---|
//! | C1 | [`integer_set`] | Row-index sets: sparse vector / bitmap, auto-switching. |
//! | C2 | [`column`] | Per-feature columnar storage with optional value interning. |
//! | C3 | [`distance`] | Per-feature Minkowski distance terms and missing-value policy. |
//! | C4 | [`partial_sum`] | Interleaved (sum, computed-features-bitmap) rows for pruning. |
//! | C5 | [`store`] | The table itself: builds/maintains columns, answers every query. |
//! | C6 | [`knn_cache`] | Per-row cached top-k neighbor lists. |
//! | C7 | [`conviction`] | Distance contributions, case/group KL-divergence, neighbor weights. |
//!
//! This crate never writes to stderr (spec.md §7); it instruments with
//! the `log` facade only, so the "silent unless a caller installs a
//! sink" invariant holds. Query failures that spec.md classifies as
//! "empty or impossible" (unknown label, zero candidates, zero
//! `top_k`) degrade to an empty result, `None`, or `NaN` rather than
//! `Err` — [`error::SbfdsError`] covers only the small set of
//! caller-facing structural failures (arity mismatches, duplicate
//! labels, out-of-bounds rows).

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod column;
pub mod conviction;
pub mod distance;
pub mod error;
pub mod heap;
pub mod integer_set;
pub mod knn_cache;
pub mod partial_sum;
pub mod store;
pub mod value;

pub use column::ColumnData;
pub use conviction::{ConvictionProcessor, DistanceTransform};
pub use distance::{DistanceEvaluator, FeatureAttributes, FeatureKind, StringResolver};
pub use error::{Result, SbfdsError};
pub use heap::StochasticTieBreakingPriorityQueue;
pub use integer_set::IntegerSet;
pub use knn_cache::KnnCache;
pub use partial_sum::PartialSumCollection;
pub use store::{LabelId, SbfdsStore, StoreConfig};
pub use value::{CodeHandle, FeatureValue, FeatureValueType, StringId};
