//! Error types for the data store's caller-facing API surface.
//!
//! Per spec: most query failures are *not* errors — an unknown label, an
//! empty candidate set, or a zero `top_k` simply yields an empty result,
//! `None`, or `NaN` (see the module docs on error handling in `store`).
//! `SbfdsError` is reserved for the small set of genuine structural
//! problems a caller can actually act on: inserting a vector of the wrong
//! arity, registering a label twice, or removing one still in use.

use thiserror::Error;

/// Errors returned by the small slice of the API that can genuinely fail.
///
/// Everything else (queries) degrades to empty results rather than
/// returning `Err` — see spec.md §7.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SbfdsError {
    #[error("feature '{label}' expected {expected} value(s), got {got}")]
    ArityMismatch {
        label: String,
        expected: usize,
        got: usize,
    },

    #[error("label '{0}' is already registered")]
    LabelAlreadyExists(String),

    #[error("label '{0}' not found")]
    UnknownLabel(String),

    #[error("label '{0}' cannot be removed: still referenced by {1} row(s)")]
    LabelStillInUse(String, usize),

    #[error("row index {0} is out of bounds (numRows = {1})")]
    RowOutOfBounds(usize, usize),

    #[error("Minkowski exponent p={0} is invalid for this operation (p must be > 0; p=0 is rejected for cache-backed queries)")]
    InvalidMinkowskiExponent(f64),
}

pub type Result<T> = std::result::Result<T, SbfdsError>;
