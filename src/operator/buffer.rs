//! Buffering operators: Collect, Sample, Group.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::StreamData;
use crate::error::FlowError;
use crate::stage::{Flow, ItemCtx, ItemHandler, StageIo, StreamHandler};
use crate::value::Value;

use super::KeyFn;

/// Buffer the whole stream and emit it as one list at completion.
pub struct Collect;

#[async_trait]
impl StreamHandler for Collect {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError> {
        let mut buffer = Vec::new();
        loop {
            match io.consumer().get().await {
                StreamData::End => break,
                StreamData::Item(value) => buffer.push(value),
            }
        }
        io.emit_item(Value::List(buffer)).await?;
        io.emit(StreamData::End).await
    }
}

/// Single-pass reservoir sampling of at most `k` items.
///
/// Yields an unbiased size-min(k, n) subset without knowing the stream
/// length in advance; items are emitted in reservoir order at completion.
pub struct Sample {
    k: usize,
    reservoir: Vec<Value>,
}

impl Sample {
    pub fn new(k: usize) -> Self {
        assert!(k >= 1, "sample size must be at least 1");
        Self {
            k,
            reservoir: Vec::with_capacity(k),
        }
    }
}

#[async_trait]
impl StreamHandler for Sample {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError> {
        let mut rng = StdRng::from_entropy();
        let mut seen = 0usize;
        loop {
            match io.consumer().get().await {
                StreamData::End => break,
                StreamData::Item(value) => {
                    if seen < self.k {
                        self.reservoir.push(value);
                    } else {
                        let slot = rng.gen_range(0..=seen);
                        if slot < self.k {
                            self.reservoir[slot] = value;
                        }
                    }
                    seen += 1;
                }
            }
        }
        for value in self.reservoir.drain(..) {
            io.emit_item(value).await?;
        }
        io.emit(StreamData::End).await
    }
}

/// Bucket items by key; emit `(key, bucket)` when a bucket fills, and flush
/// partially-filled buckets at completion when `keep_rest` is set.
///
/// Buckets flush in first-seen key order.
pub struct Group {
    by: KeyFn,
    size: usize,
    keep_rest: bool,
    buckets: Vec<(Value, Vec<Value>)>,
}

impl Group {
    pub fn new<F>(by: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, FlowError> + Send + Sync + 'static,
    {
        Self {
            by: std::sync::Arc::new(by),
            size: usize::MAX,
            keep_rest: true,
            buckets: Vec::new(),
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        assert!(size >= 2, "group size must be at least 2");
        self.size = size;
        self
    }

    pub fn with_keep_rest(mut self, keep_rest: bool) -> Self {
        self.keep_rest = keep_rest;
        self
    }
}

#[async_trait]
impl ItemHandler for Group {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        let key = (self.by)(&item)?;
        let position = self.buckets.iter().position(|(k, _)| *k == key);
        let index = match position {
            Some(i) => i,
            None => {
                self.buckets.push((key, Vec::new()));
                self.buckets.len() - 1
            }
        };
        self.buckets[index].1.push(item);
        if self.buckets[index].1.len() >= self.size {
            let (key, bucket) = self.buckets.remove(index);
            ctx.put(Value::pair(key, bucket)).await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_end(&mut self, ctx: &ItemCtx<'_>) -> Result<(), FlowError> {
        if self.keep_rest {
            for (key, bucket) in self.buckets.drain(..) {
                if !bucket.is_empty() {
                    ctx.put(Value::pair(key, bucket)).await?;
                }
            }
        }
        ctx.forward_end().await
    }
}
