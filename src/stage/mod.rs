//! Stage runtime: handler traits, the io harness and the driver loop.
//!
//! A stage is one unit of computation in the pipeline graph. Its logic comes
//! in two shapes: per-item handlers, driven by the default loop one element
//! at a time, and whole-stream handlers that own the consumer for the whole
//! activation (multi-source combination, full buffering, reservoir
//! sampling). Both emit through the frozen item-middleware chain, so
//! interception always applies.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::channel::{ChannelCore, Consumer, Queue, StreamData};
use crate::error::FlowError;
use crate::middleware::{Activation, ContextMap, ExecNext, ExecuteWare, ItemNext, ItemWare, StageInfo};
use crate::value::Value;

/// Outcome of one item activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep consuming.
    Continue,
    /// Self-terminate: behave as if the completion marker had been received.
    Done,
}

/// One-shot source of the element under dispatch.
///
/// Re-reading after the element was taken yields `End`, mirroring the
/// idempotent re-read of a finished queue.
pub struct Getter {
    slot: Option<StreamData>,
}

impl Getter {
    pub fn of(data: StreamData) -> Self {
        Self { slot: Some(data) }
    }

    pub async fn get(&mut self) -> StreamData {
        self.slot.take().unwrap_or(StreamData::End)
    }
}

/// Object-safe put surface. Item middleware may substitute adapted
/// implementations before delegating down the chain.
#[async_trait]
pub trait Put: Send + Sync {
    /// Enqueue onto output `index`, or broadcast to all outputs when `None`.
    async fn put(&self, data: StreamData, index: Option<usize>) -> Result<(), FlowError>;
}

pub type Putter = Arc<dyn Put>;

/// The put side of a running stage: one channel per output edge.
#[derive(Clone)]
pub(crate) struct Outputs {
    channels: Vec<Arc<ChannelCore>>,
}

impl Outputs {
    pub(crate) fn new(channels: Vec<Arc<ChannelCore>>) -> Self {
        Self { channels }
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Put for Outputs {
    async fn put(&self, data: StreamData, index: Option<usize>) -> Result<(), FlowError> {
        match index {
            Some(i) => {
                let channel = self.channels.get(i).ok_or(FlowError::RouteOutOfRange {
                    index: i,
                    outputs: self.channels.len(),
                })?;
                channel.put(data).await
            }
            None => {
                for channel in &self.channels {
                    channel.put(data.clone()).await?;
                }
                Ok(())
            }
        }
    }
}

/// Per-activation view handed to item handlers: the (possibly adapted)
/// putter plus the stage context.
pub struct ItemCtx<'a> {
    putter: &'a Putter,
    context: &'a ContextMap,
}

impl<'a> ItemCtx<'a> {
    pub async fn put(&self, value: Value) -> Result<(), FlowError> {
        self.putter.put(StreamData::Item(value), None).await
    }

    pub async fn put_to(&self, value: Value, index: usize) -> Result<(), FlowError> {
        self.putter.put(StreamData::Item(value), Some(index)).await
    }

    /// Forward the completion marker to every output edge.
    pub async fn forward_end(&self) -> Result<(), FlowError> {
        self.putter.put(StreamData::End, None).await
    }

    pub fn context(&self) -> &ContextMap {
        self.context
    }

    pub fn putter(&self) -> &Putter {
        self.putter
    }
}

/// Per-item stage logic, driven by the default loop.
#[async_trait]
pub trait ItemHandler: Send {
    /// Handle one real item. Return [`Flow::Done`] to self-terminate.
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError>;

    /// Handle completion: flush pending output, then forward the marker.
    /// Runs exactly once, on the upstream marker or after self-termination.
    async fn on_end(&mut self, ctx: &ItemCtx<'_>) -> Result<(), FlowError> {
        ctx.forward_end().await
    }
}

/// Whole-stream stage logic, owns the consumer for the activation.
#[async_trait]
pub trait StreamHandler: Send {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError>;
}

/// The two shapes of stage logic.
pub enum StageLogic {
    PerItem(Box<dyn ItemHandler>),
    WholeStream(Box<dyn StreamHandler>),
}

impl StageLogic {
    pub fn per_item(handler: impl ItemHandler + 'static) -> Self {
        StageLogic::PerItem(Box::new(handler))
    }

    pub fn whole_stream(handler: impl StreamHandler + 'static) -> Self {
        StageLogic::WholeStream(Box::new(handler))
    }
}

/// How a stage is scheduled: inline on the flow driver task, or managed in
/// its own spawned execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Inline,
    Managed,
}

/// Cloneable emit handle routing through the item-middleware chain.
///
/// Used by whole-stream handlers, including from concurrent pump tasks (Mix).
#[derive(Clone)]
pub struct Emitter {
    chain: Arc<[Arc<dyn ItemWare>]>,
    putter: Putter,
}

impl Emitter {
    pub async fn emit(&self, data: StreamData) -> Result<(), FlowError> {
        let mut forward = ForwardActivation;
        ItemNext::new(&self.chain, &mut forward)
            .run(Getter::of(data), self.putter.clone())
            .await
            .map(|_| ())
    }

    pub async fn emit_item(&self, value: impl Into<Value>) -> Result<(), FlowError> {
        self.emit(StreamData::Item(value.into())).await
    }
}

/// Chain terminal that forwards the element unchanged.
struct ForwardActivation;

#[async_trait]
impl Activation for ForwardActivation {
    async fn activate(&mut self, mut get: Getter, put: Putter) -> Result<Flow, FlowError> {
        let data = get.get().await;
        put.put(data, None).await?;
        Ok(Flow::Continue)
    }
}

/// Chain terminal dispatching to a stage's own per-item handler.
struct HandlerActivation<'s> {
    handler: &'s mut dyn ItemHandler,
    context: &'s ContextMap,
}

#[async_trait]
impl Activation for HandlerActivation<'_> {
    async fn activate(&mut self, mut get: Getter, put: Putter) -> Result<Flow, FlowError> {
        let ctx = ItemCtx {
            putter: &put,
            context: self.context,
        };
        match get.get().await {
            StreamData::Item(value) => self.handler.on_item(value, &ctx).await,
            StreamData::End => {
                self.handler.on_end(&ctx).await?;
                Ok(Flow::Done)
            }
        }
    }
}

/// Harness a whole-stream handler sees during its activation.
pub struct StageIo<'a> {
    consumer: &'a mut Consumer,
    emitter: Emitter,
    context: &'a ContextMap,
    num_out: usize,
}

impl StageIo<'_> {
    pub fn consumer(&mut self) -> &mut Consumer {
        self.consumer
    }

    /// Take the input queues for per-queue control.
    pub fn take_queues(&mut self) -> Vec<Queue> {
        self.consumer.take_queues()
    }

    /// Emit through the item-middleware chain (the wrapped `handler` entry
    /// point; stages must not write to outputs around it).
    pub async fn emit(&self, data: StreamData) -> Result<(), FlowError> {
        self.emitter.emit(data).await
    }

    pub async fn emit_item(&self, value: impl Into<Value>) -> Result<(), FlowError> {
        self.emitter.emit_item(value).await
    }

    /// Cloneable emit handle for concurrent sub-operations.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    pub fn context(&self) -> &ContextMap {
        self.context
    }

    pub fn num_out(&self) -> usize {
        self.num_out
    }
}

/// A built stage instance: logic plus wiring plus frozen middleware.
///
/// Consumed exactly once by `run`; there is no restart.
pub struct Stage {
    name: String,
    logic: StageLogic,
    mode: ExecutionMode,
    consumer: Consumer,
    outputs: Outputs,
    context: ContextMap,
    item_chain: Arc<[Arc<dyn ItemWare>]>,
    exec_chain: Arc<[Arc<dyn ExecuteWare>]>,
}

impl Stage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        logic: StageLogic,
        mode: ExecutionMode,
        consumer: Consumer,
        outputs: Outputs,
        context: ContextMap,
        item_chain: Arc<[Arc<dyn ItemWare>]>,
        exec_chain: Arc<[Arc<dyn ExecuteWare>]>,
    ) -> Self {
        Self {
            name,
            logic,
            mode,
            consumer,
            outputs,
            context,
            item_chain,
            exec_chain,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run the stage to completion, wrapped in the execute chain.
    pub async fn run(self) -> Result<(), FlowError> {
        let info = StageInfo {
            name: self.name.clone(),
            context: self.context.clone(),
        };
        tracing::debug!(stage = %info.name, "stage starting");

        let exec_chain = self.exec_chain;
        let item_chain = self.item_chain;
        let num_out = self.outputs.len();
        let putter: Putter = Arc::new(self.outputs);
        let emitter = Emitter {
            chain: item_chain.clone(),
            putter: putter.clone(),
        };
        let mut consumer = self.consumer;
        let mut logic = self.logic;
        let context = self.context;

        let inner: BoxFuture<'_, Result<(), FlowError>> = Box::pin(async {
            match &mut logic {
                StageLogic::PerItem(handler) => {
                    drive_per_item(
                        handler.as_mut(),
                        &mut consumer,
                        &item_chain,
                        &putter,
                        &context,
                    )
                    .await
                }
                StageLogic::WholeStream(handler) => {
                    let mut io = StageIo {
                        consumer: &mut consumer,
                        emitter,
                        context: &context,
                        num_out,
                    };
                    handler.handle_stream(&mut io).await
                }
            }
        });

        let result = ExecNext::new(&exec_chain, inner).run(&info).await;
        match &result {
            Ok(()) => tracing::debug!(stage = %info.name, "stage finished"),
            Err(e) => tracing::error!(stage = %info.name, error = %e, "stage failed"),
        }
        result
    }
}

/// Default driver loop: dispatch every element, including the completion
/// marker, through the item chain. Exactly one end activation per stage.
async fn drive_per_item(
    handler: &mut dyn ItemHandler,
    consumer: &mut Consumer,
    chain: &[Arc<dyn ItemWare>],
    putter: &Putter,
    context: &ContextMap,
) -> Result<(), FlowError> {
    loop {
        let data = consumer.get().await;
        let at_end = data.is_end();
        let flow = {
            let mut terminal = HandlerActivation {
                handler: &mut *handler,
                context,
            };
            ItemNext::new(chain, &mut terminal)
                .run(Getter::of(data), putter.clone())
                .await?
        };
        if at_end {
            return Ok(());
        }
        if flow == Flow::Done {
            // Self-termination (Take, Until): deliver the end activation now,
            // leaving the rest of the upstream elements unconsumed.
            let mut terminal = HandlerActivation {
                handler: &mut *handler,
                context,
            };
            ItemNext::new(chain, &mut terminal)
                .run(Getter::of(StreamData::End), putter.clone())
                .await?;
            return Ok(());
        }
    }
}
