//! Fan-in and fan-out operators: Merge, Split, Mix, Concat, Branch.

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::channel::{ChannelKind, StreamData};
use crate::error::FlowError;
use crate::stage::{Flow, ItemCtx, ItemHandler, StageIo, StreamHandler};
use crate::value::Value;

use super::IndexFn;

/// Zip N sources into one stream of N-tuples, one element from each source
/// per synchronized step. Always emits tuples, even for a single source.
/// Stops at the first source to end.
pub struct Merge;

#[async_trait]
impl StreamHandler for Merge {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError> {
        let mut queues = io.take_queues();
        if !queues.is_empty() {
            'steps: loop {
                let mut tuple = Vec::with_capacity(queues.len());
                for queue in &mut queues {
                    match queue.get().await {
                        StreamData::End => break 'steps,
                        StreamData::Item(value) => tuple.push(value),
                    }
                }
                io.emit_item(Value::List(tuple)).await?;
            }
        }
        io.emit(StreamData::End).await
    }
}

/// Inverse of [`Merge`]: route element `i` of each input tuple to output `i`.
pub struct Split {
    num: usize,
}

impl Split {
    pub fn new(num: usize) -> Self {
        assert!(num >= 2, "split needs at least 2 outputs");
        Self { num }
    }
}

#[async_trait]
impl ItemHandler for Split {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        match item {
            Value::List(values) if values.len() == self.num => {
                for (index, value) in values.into_iter().enumerate() {
                    ctx.put_to(value, index).await?;
                }
                Ok(Flow::Continue)
            }
            Value::List(values) => Err(FlowError::processing(format!(
                "split expects tuples of {} elements, got {}",
                self.num,
                values.len()
            ))),
            other => Err(FlowError::processing(format!(
                "split expects a sequence item, got {other}"
            ))),
        }
    }
}

/// Concurrently drain all sources, forwarding each item as soon as it is
/// produced. Arrival order across sources is nondeterministic; only the
/// output multiset is guaranteed.
///
/// Constant sources are rejected because their replay semantics would
/// duplicate elements under concurrent draining. The first failing source
/// wins: its error propagates and the remaining pumps are cancelled.
pub struct Mix;

#[async_trait]
impl StreamHandler for Mix {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError> {
        let queues = io.take_queues();
        if let Some(queue) = queues
            .iter()
            .find(|q| q.channel_kind() == ChannelKind::Constant)
        {
            return Err(FlowError::config(format!(
                "cannot mix constant channel {}",
                queue.channel_name()
            )));
        }

        let mut pumps: JoinSet<Result<(), FlowError>> = JoinSet::new();
        for mut queue in queues {
            let emitter = io.emitter();
            pumps.spawn(async move {
                loop {
                    match queue.get().await {
                        StreamData::End => return Ok(()),
                        item => emitter.emit(item).await?,
                    }
                }
            });
        }

        while let Some(joined) = pumps.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    pumps.abort_all();
                    return Err(e);
                }
                Err(join_error) => {
                    pumps.abort_all();
                    return Err(FlowError::processing(format!(
                        "mix source pump failed: {join_error}"
                    )));
                }
            }
        }
        io.emit(StreamData::End).await
    }
}

/// Fully drain the sources one after another in declared order.
pub struct Concat;

#[async_trait]
impl StreamHandler for Concat {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError> {
        let mut queues = io.take_queues();
        for queue in &mut queues {
            loop {
                match queue.get().await {
                    StreamData::End => break,
                    item => io.emit(item).await?,
                }
            }
        }
        io.emit(StreamData::End).await
    }
}

/// Route each item to exactly one of `n` outputs, chosen by the routing
/// function. An index with no matching output is a fatal error.
pub struct Branch {
    num: usize,
    by: IndexFn,
}

impl Branch {
    pub fn new<F>(num: usize, by: F) -> Self
    where
        F: Fn(&Value) -> Result<usize, FlowError> + Send + Sync + 'static,
    {
        assert!(num >= 2, "branch needs at least 2 outputs");
        Self {
            num,
            by: std::sync::Arc::new(by),
        }
    }
}

#[async_trait]
impl ItemHandler for Branch {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        let index = (self.by)(&item)?;
        if index >= self.num {
            return Err(FlowError::RouteOutOfRange {
                index,
                outputs: self.num,
            });
        }
        ctx.put_to(item, index).await?;
        Ok(Flow::Continue)
    }
}
