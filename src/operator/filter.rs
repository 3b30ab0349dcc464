//! Dropping and truncating operators: Filter, Unique, Distinct, Take, Until.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::FlowError;
use crate::stage::{Flow, ItemCtx, ItemHandler};
use crate::value::Value;

use super::Predicate;

/// Keep an item iff the predicate holds (or the item equals the identity).
pub struct Filter {
    by: Predicate,
}

impl Filter {
    pub fn new(by: Predicate) -> Self {
        Self { by }
    }
}

#[async_trait]
impl ItemHandler for Filter {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        if self.by.matches(&item)? {
            ctx.put(item).await?;
        }
        Ok(Flow::Continue)
    }
}

/// Keep only the first-ever occurrence of each value.
///
/// The seen-set is unbounded; every distinct value is remembered until the
/// stage finishes.
#[derive(Default)]
pub struct Unique {
    seen: HashSet<Value>,
}

impl Unique {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemHandler for Unique {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        if self.seen.insert(item.clone()) {
            ctx.put(item).await?;
        }
        Ok(Flow::Continue)
    }
}

/// Collapse consecutive runs of equal items; non-adjacent duplicates pass.
#[derive(Default)]
pub struct Distinct {
    prev: Option<Value>,
}

impl Distinct {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemHandler for Distinct {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        if self.prev.as_ref() != Some(&item) {
            self.prev = Some(item.clone());
            ctx.put(item).await?;
        }
        Ok(Flow::Continue)
    }
}

/// Forward the first `n` items, then self-terminate without consuming the
/// rest of the source.
pub struct Take {
    remaining: usize,
}

impl Take {
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "take count must be at least 1");
        Self { remaining: n }
    }

    /// Take exactly the first item.
    pub fn first() -> Self {
        Take::new(1)
    }
}

#[async_trait]
impl ItemHandler for Take {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        if self.remaining == 0 {
            return Ok(Flow::Done);
        }
        ctx.put(item).await?;
        self.remaining -= 1;
        if self.remaining == 0 {
            Ok(Flow::Done)
        } else {
            Ok(Flow::Continue)
        }
    }
}

/// Forward items while the stop condition is false; the matching item is
/// dropped and the stage self-terminates, forwarding the completion marker
/// downstream.
pub struct Until {
    by: Predicate,
}

impl Until {
    pub fn new(by: Predicate) -> Self {
        Self { by }
    }
}

#[async_trait]
impl ItemHandler for Until {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        if self.by.matches(&item)? {
            return Ok(Flow::Done);
        }
        ctx.put(item).await?;
        Ok(Flow::Continue)
    }
}
