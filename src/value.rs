//! Tagged feature values.
//!
//! A row's cell in a column is exactly one of: a number, an interned
//! string, a reference into an evaluable-code arena owned elsewhere, or
//! an explicit null. A fifth state — "invalid" (the row doesn't carry
//! this feature at all) — is *not* a value; it is tracked by which of
//! the column's disjoint row-sets contains the row (see `column.rs`).
//!
//! Code values are the one place this store touches memory it does not
//! own. The interpreter's evaluable-tree arena manages the actual node;
//! we only ever need two things about it — its deep size and deep
//! equality to another node — so the core depends on those through the
//! `CodeHandle` trait rather than holding a raw pointer into someone
//! else's arena. Callers hand us an `Arc<dyn CodeHandle>`; we clone the
//! handle (cheap refcount bump), never the tree.

use std::fmt;
use std::sync::Arc;

/// A non-owning handle to an evaluable-code node living in the
/// interpreter's arena. The core never constructs, mutates, or frees
/// these — it only compares and sizes them.
pub trait CodeHandle: Send + Sync + fmt::Debug {
    /// Total node count of the subtree rooted here.
    fn deep_size(&self) -> usize;

    /// Structural (deep) equality against another code handle.
    fn deep_eq(&self, other: &dyn CodeHandle) -> bool;
}

/// Interned string identifier. Resolution to the actual `String` happens
/// through a process-wide string-intern pool external to this crate (see
/// spec.md §5 "Shared-resource policy"); the store only ever compares and
/// stores these ids.
pub type StringId = u32;

/// One cell's worth of feature data.
#[derive(Clone)]
pub enum FeatureValue {
    Number(f64),
    StringId(StringId),
    Code(Arc<dyn CodeHandle>),
    /// Explicit null or NaN-equivalent — distinct from "invalid" (feature
    /// absent), which is a property of row membership, not a value.
    Null,
}

impl fmt::Debug for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Number(n) => write!(f, "Number({n})"),
            FeatureValue::StringId(s) => write!(f, "StringId({s})"),
            FeatureValue::Code(c) => write!(f, "Code({c:?})"),
            FeatureValue::Null => write!(f, "Null"),
        }
    }
}

impl PartialEq for FeatureValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FeatureValue::Number(a), FeatureValue::Number(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (FeatureValue::StringId(a), FeatureValue::StringId(b)) => a == b,
            (FeatureValue::Code(a), FeatureValue::Code(b)) => a.deep_eq(b.as_ref()),
            (FeatureValue::Null, FeatureValue::Null) => true,
            _ => false,
        }
    }
}

/// The discriminant of a [`FeatureValue`], plus the disjoint "invalid"
/// state a row can be in for a given column (feature entirely absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureValueType {
    Number,
    StringId,
    Code,
    Null,
    Invalid,
}

impl FeatureValue {
    pub fn value_type(&self) -> FeatureValueType {
        match self {
            FeatureValue::Number(n) if n.is_nan() => FeatureValueType::Null,
            FeatureValue::Number(_) => FeatureValueType::Number,
            FeatureValue::StringId(_) => FeatureValueType::StringId,
            FeatureValue::Code(_) => FeatureValueType::Code,
            FeatureValue::Null => FeatureValueType::Null,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            FeatureValue::StringId(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&Arc<dyn CodeHandle>> {
        match self {
            FeatureValue::Code(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value_type(), FeatureValueType::Null)
    }
}
