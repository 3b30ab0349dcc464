//! Pass-through side-effect operators: Subscribe, View.

use async_trait::async_trait;

use crate::error::FlowError;
use crate::stage::{Flow, ItemCtx, ItemHandler};
use crate::value::Value;

use super::{CompleteFn, NextFn};

/// Pass-through stage invoking `on_next` per real item and `on_complete`
/// exactly once at completion, as a side effect only.
#[derive(Default)]
pub struct Subscribe {
    on_next: Option<NextFn>,
    on_complete: Option<CompleteFn>,
}

impl Subscribe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_next<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_next = Some(std::sync::Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(std::sync::Arc::new(f));
        self
    }
}

#[async_trait]
impl ItemHandler for Subscribe {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        if let Some(f) = &self.on_next {
            f(&item);
        }
        ctx.put(item).await?;
        Ok(Flow::Continue)
    }

    async fn on_end(&mut self, ctx: &ItemCtx<'_>) -> Result<(), FlowError> {
        if let Some(f) = &self.on_complete {
            f();
        }
        ctx.forward_end().await
    }
}

/// Pass-through stage printing each item, with `{x}` as the item
/// placeholder in the format template.
pub struct View {
    fmt: String,
}

impl Default for View {
    fn default() -> Self {
        Self {
            fmt: "{x}".to_string(),
        }
    }
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(fmt: impl Into<String>) -> Self {
        Self { fmt: fmt.into() }
    }
}

#[async_trait]
impl ItemHandler for View {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        println!("{}", self.fmt.replace("{x}", &item.to_string()));
        ctx.put(item).await?;
        Ok(Flow::Continue)
    }
}
