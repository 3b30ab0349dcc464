//! Folding operators: Reduce and its Sum/Count/Min/Max shorthands, Last.
//!
//! All of these emit their single result at completion, and emit nothing at
//! all on an empty input.

use async_trait::async_trait;

use crate::error::FlowError;
use crate::stage::{Flow, ItemCtx, ItemHandler};
use crate::value::Value;

use super::FoldFn;

/// Running fold over the stream.
///
/// Without a seed the first item becomes the accumulator; with a seed the
/// fold function is applied from the first item on.
pub struct Reduce {
    by: FoldFn,
    seed: Option<Value>,
    acc: Option<Value>,
}

impl Reduce {
    pub fn new<F>(by: F) -> Self
    where
        F: Fn(Value, Value) -> Result<Value, FlowError> + Send + Sync + 'static,
    {
        Self {
            by: std::sync::Arc::new(by),
            seed: None,
            acc: None,
        }
    }

    pub fn with_seed(mut self, seed: impl Into<Value>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    /// Numeric sum; integers stay integral, any float makes the result float.
    pub fn sum() -> Self {
        Reduce::new(|acc, item| numeric_add(acc, item)).with_seed(Value::Int(0))
    }

    /// Count of real items.
    pub fn count() -> Self {
        Reduce::new(|acc, _item| match acc {
            Value::Int(n) => Ok(Value::Int(n + 1)),
            other => Err(FlowError::processing(format!(
                "count accumulator must be integral, got {other}"
            ))),
        })
        .with_seed(Value::Int(0))
    }

    pub fn min() -> Self {
        Reduce::new(|acc, item| Ok(if item < acc { item } else { acc }))
    }

    pub fn max() -> Self {
        Reduce::new(|acc, item| Ok(if item > acc { item } else { acc }))
    }
}

fn numeric_add(a: Value, b: Value) -> Result<Value, FlowError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x + y)),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(x as f64 + y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        (a, b) => Err(FlowError::processing(format!(
            "cannot add non-numeric values {a} and {b}"
        ))),
    }
}

#[async_trait]
impl ItemHandler for Reduce {
    async fn on_item(&mut self, item: Value, _ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        self.acc = Some(match self.acc.take() {
            Some(acc) => (self.by)(acc, item)?,
            None => match self.seed.clone() {
                Some(seed) => (self.by)(seed, item)?,
                None => item,
            },
        });
        Ok(Flow::Continue)
    }

    async fn on_end(&mut self, ctx: &ItemCtx<'_>) -> Result<(), FlowError> {
        if let Some(acc) = self.acc.take() {
            ctx.put(acc).await?;
        }
        ctx.forward_end().await
    }
}

/// Remember only the most recent item and emit it once at completion.
#[derive(Default)]
pub struct Last {
    prev: Option<Value>,
}

impl Last {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemHandler for Last {
    async fn on_item(&mut self, item: Value, _ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        self.prev = Some(item);
        Ok(Flow::Continue)
    }

    async fn on_end(&mut self, ctx: &ItemCtx<'_>) -> Result<(), FlowError> {
        if let Some(prev) = self.prev.take() {
            ctx.put(prev).await?;
        }
        ctx.forward_end().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_add_promotes_to_float() {
        assert_eq!(
            numeric_add(Value::Int(1), Value::Float(0.5)).expect("add"),
            Value::Float(1.5)
        );
        assert_eq!(
            numeric_add(Value::Int(2), Value::Int(3)).expect("add"),
            Value::Int(5)
        );
    }

    #[test]
    fn numeric_add_rejects_text() {
        let err = numeric_add(Value::from("a"), Value::Int(1)).unwrap_err();
        assert!(matches!(err, FlowError::Processing(_)));
    }
}
