//! Asynchronous dataflow pipelines.
//!
//! A flow is a directed graph of stages wired by bounded channels. Items are
//! dynamically typed [`Value`]s; every stream ends with exactly one
//! completion marker ([`StreamData::End`]). Stages are either per-item
//! handlers or whole-stream handlers, and every activation runs through the
//! configured [`middleware`] chains.
//!
//! ```no_run
//! use tributary::{FlowBuilder, Predicate};
//!
//! # async fn demo() -> Result<(), tributary::FlowError> {
//! let builder = FlowBuilder::new();
//! builder
//!     .values(1..=10)
//!     .filter(Predicate::func(|v| Ok(v.as_int().is_some_and(|n| n % 2 == 0))))
//!     .map(|v| Ok(v))
//!     .sum()
//!     .view();
//! builder.build()?.run().await
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod flow;
pub mod middleware;
pub mod operator;
pub mod stage;
pub mod value;

pub use channel::{ChannelKind, Consumer, Queue, StreamData};
pub use config::FlowConfig;
pub use error::FlowError;
pub use flow::{concat, merge, mix, FlowBuilder, Pipeline, RunningFlow, StreamRef};
pub use middleware::{
    install_global, BuildWare, ContextMap, ExecuteWare, ItemWare, Middleware, StageInfo, StageSeed,
};
pub use operator::{Group, Predicate, Reduce, Subscribe};
pub use stage::{
    ExecutionMode, Flow, Getter, ItemCtx, ItemHandler, Put, Putter, StageIo, StageLogic,
    StreamHandler,
};
pub use value::{Key, Value};
