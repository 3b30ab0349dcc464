//! Item-shaping operators: Map, GetItem, Flatten.

use async_trait::async_trait;

use crate::error::FlowError;
use crate::stage::{Flow, ItemCtx, ItemHandler};
use crate::value::{Key, Value};

use super::MapFn;

/// Replace each item with the result of the map function.
pub struct Map {
    by: MapFn,
}

impl Map {
    pub fn new<F>(by: F) -> Self
    where
        F: Fn(Value) -> Result<Value, FlowError> + Send + Sync + 'static,
    {
        Self {
            by: std::sync::Arc::new(by),
        }
    }
}

#[async_trait]
impl ItemHandler for Map {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        ctx.put((self.by)(item)?).await?;
        Ok(Flow::Continue)
    }
}

/// Emit `item[key]`; on structural failure (wrong shape, missing key or
/// index) emit a fresh copy of the default instead. Lookup errors never
/// abort the stage.
pub struct GetItem {
    key: Key,
    default: Value,
}

impl GetItem {
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            default: Value::Null,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }
}

/// Alias for [`GetItem`].
pub type Select = GetItem;
/// Alias for [`GetItem`].
pub type Get = GetItem;

#[async_trait]
impl ItemHandler for GetItem {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        let out = item
            .get(&self.key)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        ctx.put(out).await?;
        Ok(Flow::Continue)
    }
}

/// Recursively expand nested list values, emitting each leaf separately.
///
/// Text values are atomic and never expanded. A max level of zero means
/// effectively unbounded depth.
pub struct Flatten {
    max_level: usize,
}

impl Flatten {
    pub fn new(max_level: usize) -> Self {
        Self {
            max_level: if max_level == 0 {
                usize::MAX
            } else {
                max_level
            },
        }
    }

    pub fn unbounded() -> Self {
        Flatten::new(0)
    }

    fn expand(value: Value, level: usize, max_level: usize, out: &mut Vec<Value>) {
        match value {
            Value::List(items) if level < max_level => {
                for item in items {
                    Self::expand(item, level + 1, max_level, out);
                }
            }
            leaf => out.push(leaf),
        }
    }
}

#[async_trait]
impl ItemHandler for Flatten {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        let mut leaves = Vec::new();
        Self::expand(item, 0, self.max_level, &mut leaves);
        for leaf in leaves {
            ctx.put(leaf).await?;
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> Value {
        // [[1, 2], [3, [4, 5]]]
        Value::list([Value::list([1, 2]), Value::list([Value::Int(3), Value::list([4, 5])])])
    }

    #[test]
    fn flatten_one_level() {
        let mut out = Vec::new();
        Flatten::expand(nested(), 0, 1, &mut out);
        assert_eq!(
            out,
            vec![Value::list([1, 2]), Value::list([Value::Int(3), Value::list([4, 5])])]
        );
    }

    #[test]
    fn flatten_two_levels() {
        let mut out = Vec::new();
        Flatten::expand(nested(), 0, 2, &mut out);
        assert_eq!(
            out,
            vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::list([4, 5])
            ]
        );
    }

    #[test]
    fn flatten_unbounded() {
        let mut out = Vec::new();
        Flatten::expand(nested(), 0, usize::MAX, &mut out);
        assert_eq!(
            out,
            vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(4),
                Value::Int(5)
            ]
        );
    }
}
