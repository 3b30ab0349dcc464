//! Build, execute and item interception chains.
//!
//! Each kind is an ordered list of wrappers composed once at stage
//! construction (configure-then-freeze). A wrapper receives a `next` handle
//! and normally delegates to it; not calling `next` short-circuits the rest
//! of the chain and the base behaviour. The first registered wrapper runs
//! outermost. Empty chains are the identity.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;

use crate::error::FlowError;
use crate::stage::{Flow, Getter, Putter};

/// Per-stage context mapping, populated by build middleware and readable
/// during execution.
pub type ContextMap = HashMap<String, serde_json::Value>;

/// Mutable view of a stage while it is being built.
pub struct StageSeed {
    pub name: String,
    pub num_out: usize,
    pub context: ContextMap,
}

/// Read-only view of a stage handed to execution middleware.
pub struct StageInfo {
    pub name: String,
    pub context: ContextMap,
}

/// Interceptor running once per stage instance, right after construction and
/// before any execution. Typical use: annotate the stage context.
pub trait BuildWare: Send + Sync {
    fn on_build(&self, seed: &mut StageSeed, next: BuildNext<'_>) -> Result<(), FlowError>;
}

/// Remainder of a build chain.
pub struct BuildNext<'a> {
    rest: &'a [Arc<dyn BuildWare>],
}

impl<'a> BuildNext<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn BuildWare>]) -> Self {
        Self { rest: chain }
    }

    pub fn run(self, seed: &mut StageSeed) -> Result<(), FlowError> {
        match self.rest.split_first() {
            Some((head, tail)) => head.on_build(seed, BuildNext { rest: tail }),
            None => Ok(()),
        }
    }
}

/// Interceptor wrapping the entire activation of a stage.
///
/// Typical use: lazily establish a process-wide shared resource the first
/// time any stage needs it, then delegate.
#[async_trait]
pub trait ExecuteWare: Send + Sync {
    async fn around_execute(
        &self,
        info: &StageInfo,
        next: ExecNext<'_>,
    ) -> Result<(), FlowError>;
}

/// Remainder of an execute chain, ending at the stage activation itself.
pub struct ExecNext<'a> {
    rest: &'a [Arc<dyn ExecuteWare>],
    inner: BoxFuture<'a, Result<(), FlowError>>,
}

impl<'a> ExecNext<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn ExecuteWare>],
        inner: BoxFuture<'a, Result<(), FlowError>>,
    ) -> Self {
        Self { rest: chain, inner }
    }

    pub fn run(self, info: &'a StageInfo) -> BoxFuture<'a, Result<(), FlowError>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, tail)) => {
                    head.around_execute(
                        info,
                        ExecNext {
                            rest: tail,
                            inner: self.inner,
                        },
                    )
                    .await
                }
                None => self.inner.await,
            }
        })
    }
}

/// Interceptor wrapping one item activation.
///
/// Receives the raw getter/putter and may substitute adapted versions, for
/// example a putter that drops items failing a secondary condition while
/// always forwarding the completion marker.
#[async_trait]
pub trait ItemWare: Send + Sync {
    async fn around_item(
        &self,
        get: Getter,
        put: Putter,
        next: ItemNext<'_>,
    ) -> Result<Flow, FlowError>;
}

/// Terminal of an item chain: the stage's own handler or a plain forward.
#[async_trait]
pub(crate) trait Activation: Send {
    async fn activate(&mut self, get: Getter, put: Putter) -> Result<Flow, FlowError>;
}

/// Remainder of an item chain.
pub struct ItemNext<'a> {
    rest: &'a [Arc<dyn ItemWare>],
    terminal: &'a mut dyn Activation,
}

impl<'a> ItemNext<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn ItemWare>], terminal: &'a mut dyn Activation) -> Self {
        Self {
            rest: chain,
            terminal,
        }
    }

    pub fn run(self, get: Getter, put: Putter) -> BoxFuture<'a, Result<Flow, FlowError>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, tail)) => {
                    head.around_item(
                        get,
                        put,
                        ItemNext {
                            rest: tail,
                            terminal: self.terminal,
                        },
                    )
                    .await
                }
                None => self.terminal.activate(get, put).await,
            }
        })
    }
}

/// The three interception chains of a flow.
///
/// Later configuration changes never affect stages that were already built;
/// every stage freezes its own snapshot at construction.
#[derive(Clone, Default)]
pub struct Middleware {
    build: Vec<Arc<dyn BuildWare>>,
    execute: Vec<Arc<dyn ExecuteWare>>,
    item: Vec<Arc<dyn ItemWare>>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build(mut self, ware: impl BuildWare + 'static) -> Self {
        self.build.push(Arc::new(ware));
        self
    }

    pub fn with_execute(mut self, ware: impl ExecuteWare + 'static) -> Self {
        self.execute.push(Arc::new(ware));
        self
    }

    pub fn with_item(mut self, ware: impl ItemWare + 'static) -> Self {
        self.item.push(Arc::new(ware));
        self
    }

    pub(crate) fn run_build(&self, seed: &mut StageSeed) -> Result<(), FlowError> {
        BuildNext::new(&self.build).run(seed)
    }

    pub(crate) fn execute_chain(&self) -> Arc<[Arc<dyn ExecuteWare>]> {
        self.execute.clone().into()
    }

    pub(crate) fn item_chain(&self) -> Arc<[Arc<dyn ItemWare>]> {
        self.item.clone().into()
    }
}

static GLOBAL_MIDDLEWARE: OnceCell<Middleware> = OnceCell::new();

/// Install the process-wide default middleware, used by every flow built
/// without an explicit override. May only be installed once, before flows
/// are constructed.
pub fn install_global(middleware: Middleware) -> Result<(), FlowError> {
    GLOBAL_MIDDLEWARE
        .set(middleware)
        .map_err(|_| FlowError::config("global middleware already installed"))
}

pub(crate) fn global() -> Option<&'static Middleware> {
    GLOBAL_MIDDLEWARE.get()
}
