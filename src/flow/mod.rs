//! Fluent graph construction and execution.
//!
//! A [`FlowBuilder`] accumulates channels and stage specs; [`StreamRef`]
//! handles chain operators onto channels. `build` freezes the graph, runs
//! the build-middleware chain per stage and wires the channels; `start`
//! spawns managed stages and drives inline operators together on one task.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelCore, ChannelKind, Consumer, Queue, StreamData};
use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::middleware::{self, ContextMap, Middleware, StageSeed};
use crate::operator::{
    Branch, Collect, Concat, Distinct, Filter, Flatten, GetItem, Group, Last, Map, Merge, Mix,
    Predicate, Reduce, Sample, Split, Subscribe, Take, Unique, Until, ValuesSource, View,
};
use crate::stage::{ExecutionMode, Outputs, Stage, StageLogic};
use crate::value::{Key, Value};

struct ChannelSpec {
    name: String,
    kind: ChannelKind,
    /// Pre-committed value for constant source channels.
    preset: Option<Value>,
    /// External tap senders handed out before build.
    taps: Vec<mpsc::Sender<StreamData>>,
}

struct StageSpec {
    name: String,
    logic: Option<StageLogic>,
    mode: ExecutionMode,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

struct GraphInner {
    config: FlowConfig,
    middleware: Middleware,
    channels: Vec<ChannelSpec>,
    stages: Vec<StageSpec>,
    built: bool,
}

impl GraphInner {
    fn add_channel(&mut self, name: String, kind: ChannelKind, preset: Option<Value>) -> usize {
        self.channels.push(ChannelSpec {
            name,
            kind,
            preset,
            taps: Vec::new(),
        });
        self.channels.len() - 1
    }

    fn add_stage(
        &mut self,
        op: &str,
        logic: StageLogic,
        mode: ExecutionMode,
        inputs: Vec<usize>,
        num_out: usize,
        out_kind: ChannelKind,
    ) -> Vec<usize> {
        let index = self.stages.len();
        let name = format!("{op}_{index}");
        let outputs: Vec<usize> = (0..num_out)
            .map(|i| self.add_channel(format!("{name}.out{i}"), out_kind, None))
            .collect();
        self.stages.push(StageSpec {
            name,
            logic: Some(logic),
            mode,
            inputs,
            outputs: outputs.clone(),
        });
        outputs
    }
}

/// Builder for one pipeline graph.
pub struct FlowBuilder {
    graph: Arc<Mutex<GraphInner>>,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder {
    /// Start a new graph, snapshotting the process-wide middleware if one
    /// was installed.
    pub fn new() -> Self {
        let middleware = middleware::global().cloned().unwrap_or_default();
        Self {
            graph: Arc::new(Mutex::new(GraphInner {
                config: FlowConfig::default(),
                middleware,
                channels: Vec::new(),
                stages: Vec::new(),
                built: false,
            })),
        }
    }

    pub fn with_config(self, config: FlowConfig) -> Self {
        self.lock().config = config;
        self
    }

    /// Override the middleware for this flow only.
    pub fn with_middleware(self, middleware: Middleware) -> Self {
        self.lock().middleware = middleware;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphInner> {
        self.graph.lock().expect("flow graph poisoned")
    }

    /// Source emitting the given values, then the completion marker.
    pub fn values<I, T>(&self, items: I) -> StreamRef
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let outputs = self.lock().add_stage(
            "values",
            StageLogic::whole_stream(ValuesSource::new(items)),
            ExecutionMode::Inline,
            Vec::new(),
            1,
            ChannelKind::Buffered,
        );
        StreamRef {
            graph: self.graph.clone(),
            channel: outputs[0],
        }
    }

    /// Constant channel pre-committed with one value; replays
    /// `{value, End}` to every consumer attached to it.
    pub fn constant(&self, value: impl Into<Value>) -> StreamRef {
        let mut graph = self.lock();
        let index = graph.channels.len();
        let channel = graph.add_channel(
            format!("const_{index}"),
            ChannelKind::Constant,
            Some(value.into()),
        );
        drop(graph);
        StreamRef {
            graph: self.graph.clone(),
            channel,
        }
    }

    /// Freeze the graph, run build middleware and wire all channels.
    pub fn build(self) -> Result<Pipeline, FlowError> {
        let mut graph = self.lock();
        if graph.built {
            return Err(FlowError::config("flow graph already built"));
        }
        graph.built = true;
        let capacity = graph.config.channel_capacity.max(2);

        let mut channel_senders: Vec<Vec<mpsc::Sender<StreamData>>> =
            (0..graph.channels.len()).map(|_| Vec::new()).collect();
        let mut stage_queues: Vec<Vec<Queue>> =
            (0..graph.stages.len()).map(|_| Vec::new()).collect();

        for (si, spec) in graph.stages.iter().enumerate() {
            for &ch in &spec.inputs {
                let (tx, rx) = mpsc::channel(capacity);
                channel_senders[ch].push(tx);
                stage_queues[si].push(Queue::new(
                    rx,
                    graph.channels[ch].name.clone(),
                    graph.channels[ch].kind,
                ));
            }
        }
        for (ci, spec) in graph.channels.iter_mut().enumerate() {
            channel_senders[ci].append(&mut spec.taps);
        }

        let cores: Vec<Arc<ChannelCore>> = graph
            .channels
            .iter()
            .zip(channel_senders)
            .map(|(spec, senders)| Arc::new(ChannelCore::new(spec.name.clone(), spec.kind, senders)))
            .collect();
        for (ci, spec) in graph.channels.iter().enumerate() {
            if let Some(value) = &spec.preset {
                cores[ci].commit_initial(value.clone());
            }
        }

        let flow_middleware = graph.middleware.clone();
        let item_chain = flow_middleware.item_chain();
        let exec_chain = flow_middleware.execute_chain();

        let mut stages = Vec::with_capacity(graph.stages.len());
        for (si, spec) in graph.stages.iter_mut().enumerate() {
            let logic = spec
                .logic
                .take()
                .ok_or_else(|| FlowError::config(format!("stage {} has no logic", spec.name)))?;
            let mut seed = StageSeed {
                name: spec.name.clone(),
                num_out: spec.outputs.len(),
                context: ContextMap::new(),
            };
            flow_middleware.run_build(&mut seed)?;

            let consumer = Consumer::new(std::mem::take(&mut stage_queues[si]));
            let outputs = Outputs::new(spec.outputs.iter().map(|&c| cores[c].clone()).collect());
            stages.push(Stage::new(
                spec.name.clone(),
                logic,
                spec.mode,
                consumer,
                outputs,
                seed.context,
                item_chain.clone(),
                exec_chain.clone(),
            ));
        }
        tracing::debug!(stages = stages.len(), "flow graph built");
        Ok(Pipeline { stages })
    }
}

/// Handle to one channel in a graph under construction. Cheap to clone;
/// every chaining call appends a stage consuming this channel.
#[derive(Clone)]
pub struct StreamRef {
    graph: Arc<Mutex<GraphInner>>,
    channel: usize,
}

impl StreamRef {
    fn attach(
        &self,
        op: &str,
        logic: StageLogic,
        mode: ExecutionMode,
        num_out: usize,
        out_kind: ChannelKind,
    ) -> Vec<StreamRef> {
        let outputs = self.graph.lock().expect("flow graph poisoned").add_stage(
            op,
            logic,
            mode,
            vec![self.channel],
            num_out,
            out_kind,
        );
        outputs
            .into_iter()
            .map(|channel| StreamRef {
                graph: self.graph.clone(),
                channel,
            })
            .collect()
    }

    fn attach_one(&self, op: &str, logic: StageLogic) -> StreamRef {
        self.attach(op, logic, ExecutionMode::Inline, 1, ChannelKind::Buffered)
            .pop()
            .expect("operator stage always has one output")
    }

    pub fn map<F>(&self, by: F) -> StreamRef
    where
        F: Fn(Value) -> Result<Value, FlowError> + Send + Sync + 'static,
    {
        self.attach_one("map", StageLogic::per_item(Map::new(by)))
    }

    pub fn filter(&self, by: Predicate) -> StreamRef {
        self.attach_one("filter", StageLogic::per_item(Filter::new(by)))
    }

    pub fn unique(&self) -> StreamRef {
        self.attach_one("unique", StageLogic::per_item(Unique::new()))
    }

    pub fn distinct(&self) -> StreamRef {
        self.attach_one("distinct", StageLogic::per_item(Distinct::new()))
    }

    /// `item[key]` with a default for structural misses.
    pub fn get_item(&self, key: impl Into<Key>, default: impl Into<Value>) -> StreamRef {
        self.attach_one(
            "get_item",
            StageLogic::per_item(GetItem::new(key).with_default(default)),
        )
    }

    pub fn take(&self, n: usize) -> StreamRef {
        self.attach_one("take", StageLogic::per_item(Take::new(n)))
    }

    pub fn first(&self) -> StreamRef {
        self.attach_one("first", StageLogic::per_item(Take::first()))
    }

    pub fn last(&self) -> StreamRef {
        self.attach_one("last", StageLogic::per_item(Last::new()))
    }

    pub fn until(&self, by: Predicate) -> StreamRef {
        self.attach_one("until", StageLogic::per_item(Until::new(by)))
    }

    /// Take the first item onto a replayable constant channel.
    pub fn constant(&self) -> StreamRef {
        self.attach(
            "constant",
            StageLogic::per_item(Take::first()),
            ExecutionMode::Inline,
            1,
            ChannelKind::Constant,
        )
        .pop()
        .expect("operator stage always has one output")
    }

    pub fn collect(&self) -> StreamRef {
        self.attach_one("collect", StageLogic::whole_stream(Collect))
    }

    pub fn sample(&self, k: usize) -> StreamRef {
        self.attach_one("sample", StageLogic::whole_stream(Sample::new(k)))
    }

    /// Expand nested lists down to `max_level` levels; zero means unbounded.
    pub fn flatten(&self, max_level: usize) -> StreamRef {
        self.attach_one("flatten", StageLogic::per_item(Flatten::new(max_level)))
    }

    pub fn group(&self, group: Group) -> StreamRef {
        self.attach_one("group", StageLogic::per_item(group))
    }

    pub fn reduce(&self, reduce: Reduce) -> StreamRef {
        self.attach_one("reduce", StageLogic::per_item(reduce))
    }

    pub fn sum(&self) -> StreamRef {
        self.attach_one("sum", StageLogic::per_item(Reduce::sum()))
    }

    pub fn count(&self) -> StreamRef {
        self.attach_one("count", StageLogic::per_item(Reduce::count()))
    }

    pub fn min(&self) -> StreamRef {
        self.attach_one("min", StageLogic::per_item(Reduce::min()))
    }

    pub fn max(&self) -> StreamRef {
        self.attach_one("max", StageLogic::per_item(Reduce::max()))
    }

    pub fn subscribe(&self, subscribe: Subscribe) -> StreamRef {
        self.attach_one("subscribe", StageLogic::per_item(subscribe))
    }

    pub fn view(&self) -> StreamRef {
        self.attach_one("view", StageLogic::per_item(View::new()))
    }

    pub fn view_fmt(&self, fmt: impl Into<String>) -> StreamRef {
        self.attach_one("view", StageLogic::per_item(View::with_format(fmt)))
    }

    /// Route items across `num` outputs by the routing function.
    pub fn branch<F>(&self, num: usize, by: F) -> Vec<StreamRef>
    where
        F: Fn(&Value) -> Result<usize, FlowError> + Send + Sync + 'static,
    {
        self.attach(
            "branch",
            StageLogic::per_item(Branch::new(num, by)),
            ExecutionMode::Inline,
            num,
            ChannelKind::Buffered,
        )
    }

    /// Split tuple items element-wise across `num` outputs.
    pub fn split(&self, num: usize) -> Vec<StreamRef> {
        self.attach(
            "split",
            StageLogic::per_item(Split::new(num)),
            ExecutionMode::Inline,
            num,
            ChannelKind::Buffered,
        )
    }

    pub fn merge_with(&self, other: &StreamRef) -> StreamRef {
        merge(&[self.clone(), other.clone()])
    }

    pub fn mix_with(&self, other: &StreamRef) -> StreamRef {
        mix(&[self.clone(), other.clone()])
    }

    pub fn concat_with(&self, other: &StreamRef) -> StreamRef {
        concat(&[self.clone(), other.clone()])
    }

    /// Attach a user-supplied stage running in its own managed execution
    /// context.
    pub fn then(&self, name: &str, logic: StageLogic) -> StreamRef {
        self.attach(name, logic, ExecutionMode::Managed, 1, ChannelKind::Buffered)
            .pop()
            .expect("stage always has one output")
    }

    /// External tap on this channel for tests and embedding.
    pub fn receiver(&self) -> mpsc::Receiver<StreamData> {
        let mut graph = self.graph.lock().expect("flow graph poisoned");
        let capacity = graph.config.channel_capacity.max(2);
        let (tx, rx) = mpsc::channel(capacity);
        graph.channels[self.channel].taps.push(tx);
        rx
    }
}

fn fan_in(refs: &[StreamRef], op: &str, logic: StageLogic) -> StreamRef {
    assert!(!refs.is_empty(), "{op} needs at least one input stream");
    let graph = refs[0].graph.clone();
    for r in refs {
        assert!(
            Arc::ptr_eq(&graph, &r.graph),
            "cannot combine streams from different flows"
        );
    }
    let inputs = refs.iter().map(|r| r.channel).collect();
    let outputs = graph.lock().expect("flow graph poisoned").add_stage(
        op,
        logic,
        ExecutionMode::Inline,
        inputs,
        1,
        ChannelKind::Buffered,
    );
    StreamRef {
        graph,
        channel: outputs[0],
    }
}

/// Zip the given streams into tuples, one element per source per step.
pub fn merge(refs: &[StreamRef]) -> StreamRef {
    fan_in(refs, "merge", StageLogic::whole_stream(Merge))
}

/// Interleave the given streams in arrival order.
pub fn mix(refs: &[StreamRef]) -> StreamRef {
    fan_in(refs, "mix", StageLogic::whole_stream(Mix))
}

/// Concatenate the given streams in declared order.
pub fn concat(refs: &[StreamRef]) -> StreamRef {
    fan_in(refs, "concat", StageLogic::whole_stream(Concat))
}

/// A built, not yet running flow.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl Pipeline {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Spawn managed stages and drive inline stages on one cooperative task.
    pub fn start(self) -> RunningFlow {
        let mut managed = Vec::new();
        let mut inline = Vec::new();
        for stage in self.stages {
            match stage.mode() {
                ExecutionMode::Managed => managed.push(tokio::spawn(stage.run())),
                ExecutionMode::Inline => inline.push(stage.run()),
            }
        }
        let driver = tokio::spawn(async move {
            futures::future::try_join_all(inline).await.map(|_| ())
        });
        RunningFlow { managed, driver }
    }

    /// Start and wait for completion.
    pub async fn run(self) -> Result<(), FlowError> {
        self.start().join().await
    }
}

/// Handles of a started flow.
pub struct RunningFlow {
    managed: Vec<JoinHandle<Result<(), FlowError>>>,
    driver: JoinHandle<Result<(), FlowError>>,
}

impl RunningFlow {
    /// Wait for every stage; the first stage error wins.
    pub async fn join(self) -> Result<(), FlowError> {
        let mut first_err: Option<FlowError> = None;
        let mut record = |result: Result<Result<(), FlowError>, tokio::task::JoinError>| {
            let outcome = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(join_error) => {
                    FlowError::processing(format!("stage task failed: {join_error}"))
                }
            };
            if first_err.is_none() {
                first_err = Some(outcome);
            }
        };
        record(self.driver.await);
        for handle in self.managed {
            record(handle.await);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
