//! The built-in operator catalog: ~25 reusable stream transformations.
//!
//! Every operator is a stage. Per-item operators implement
//! [`ItemHandler`](crate::stage::ItemHandler); operators needing whole-stream
//! visibility (multi-source combination, full buffering, reservoir sampling)
//! implement [`StreamHandler`](crate::stage::StreamHandler) instead.
//!
//! User-supplied callables are fallible; their errors propagate unchanged and
//! abort the owning stage.

pub mod buffer;
pub mod combine;
pub mod filter;
pub mod fold;
pub mod observe;
pub mod source;
pub mod transform;

use std::sync::Arc;

use crate::error::FlowError;
use crate::value::Value;

pub use buffer::{Collect, Group, Sample};
pub use combine::{Branch, Concat, Merge, Mix, Split};
pub use filter::{Distinct, Filter, Take, Unique, Until};
pub use fold::{Last, Reduce};
pub use observe::{Subscribe, View};
pub use source::ValuesSource;
pub use transform::{Flatten, Get, GetItem, Map, Select};

/// Fallible predicate over a borrowed item.
pub type PredicateFn = Arc<dyn Fn(&Value) -> Result<bool, FlowError> + Send + Sync>;

/// Item transformation.
pub type MapFn = Arc<dyn Fn(Value) -> Result<Value, FlowError> + Send + Sync>;

/// Grouping key extraction.
pub type KeyFn = Arc<dyn Fn(&Value) -> Result<Value, FlowError> + Send + Sync>;

/// Output-index routing function.
pub type IndexFn = Arc<dyn Fn(&Value) -> Result<usize, FlowError> + Send + Sync>;

/// Binary fold step: `(accumulator, item) -> accumulator`.
pub type FoldFn = Arc<dyn Fn(Value, Value) -> Result<Value, FlowError> + Send + Sync>;

/// Side-effect callback per real item.
pub type NextFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// Side-effect callback at completion.
pub type CompleteFn = Arc<dyn Fn() + Send + Sync>;

/// A keep/stop condition: either a callable or a comparison identity.
#[derive(Clone)]
pub enum Predicate {
    Func(PredicateFn),
    Equals(Value),
}

impl Predicate {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Result<bool, FlowError> + Send + Sync + 'static,
    {
        Predicate::Func(Arc::new(f))
    }

    pub fn equals(value: impl Into<Value>) -> Self {
        Predicate::Equals(value.into())
    }

    pub(crate) fn matches(&self, item: &Value) -> Result<bool, FlowError> {
        match self {
            Predicate::Func(f) => f(item),
            Predicate::Equals(v) => Ok(item == v),
        }
    }
}
