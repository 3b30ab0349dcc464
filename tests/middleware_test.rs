use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use tributary::middleware::{BuildNext, ExecNext, ItemNext};
use tributary::{
    BuildWare, ExecuteWare, FlowBuilder, FlowError, Getter, ItemWare, Middleware, Put, Putter,
    StageInfo, StageSeed, StreamData, Value,
};

async fn drain(mut rx: mpsc::Receiver<StreamData>) -> Vec<Value> {
    let mut out = Vec::new();
    loop {
        let next = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("receive within timeout");
        match next {
            Some(StreamData::Item(value)) => out.push(value),
            Some(StreamData::End) | None => return out,
        }
    }
}

/// Appends a marker to a context list, so chain ordering is observable.
struct TagWare(&'static str);

impl BuildWare for TagWare {
    fn on_build(&self, seed: &mut StageSeed, next: BuildNext<'_>) -> Result<(), FlowError> {
        let entry = seed
            .context
            .entry("tags".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let serde_json::Value::Array(tags) = entry {
            tags.push(serde_json::Value::String(self.0.to_string()));
        }
        next.run(seed)
    }
}

struct ContextProbe {
    seen: Arc<std::sync::Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl ExecuteWare for ContextProbe {
    async fn around_execute(
        &self,
        info: &StageInfo,
        next: ExecNext<'_>,
    ) -> Result<(), FlowError> {
        let tags: Vec<String> = info
            .context
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.seen
            .lock()
            .expect("probe results poisoned")
            .push(tags);
        next.run(info).await
    }
}

#[tokio::test]
async fn test_build_wares_run_first_registered_outermost() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let middleware = Middleware::new()
        .with_build(TagWare("outer"))
        .with_build(TagWare("inner"))
        .with_execute(ContextProbe { seen: seen.clone() });

    let builder = FlowBuilder::new().with_middleware(middleware);
    let rx = builder.values([1]).receiver();
    builder.build().expect("build flow").run().await.expect("run flow");
    drop(rx);

    let seen = seen.lock().expect("probe results poisoned");
    assert_eq!(seen.len(), 1, "one stage, one execution");
    assert_eq!(
        seen[0],
        vec!["outer".to_string(), "inner".to_string()],
        "first registered build ware appends first"
    );
}

struct CountingItemWare {
    items: Arc<AtomicUsize>,
    ends: Arc<AtomicUsize>,
}

#[async_trait]
impl ItemWare for CountingItemWare {
    async fn around_item(
        &self,
        mut get: Getter,
        put: Putter,
        next: ItemNext<'_>,
    ) -> Result<tributary::Flow, FlowError> {
        let data = get.get().await;
        match &data {
            StreamData::Item(_) => self.items.fetch_add(1, Ordering::SeqCst),
            StreamData::End => self.ends.fetch_add(1, Ordering::SeqCst),
        };
        next.run(Getter::of(data), put).await
    }
}

#[tokio::test]
async fn test_item_ware_sees_every_activation() {
    let items = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    let middleware = Middleware::new().with_item(CountingItemWare {
        items: items.clone(),
        ends: ends.clone(),
    });

    let builder = FlowBuilder::new().with_middleware(middleware);
    let rx = builder.values([1, 2, 3]).map(|v| Ok(v)).receiver();
    builder.build().expect("build flow").run().await.expect("run flow");
    assert_eq!(drain(rx).await, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

    // Three source emits plus three map dispatches.
    assert_eq!(items.load(Ordering::SeqCst), 6);
    // The source End plus the map stage's single end activation.
    assert_eq!(ends.load(Ordering::SeqCst), 2);
}

/// Drops odd integers; everything else, including End, flows through.
struct DropOddWare;

#[async_trait]
impl ItemWare for DropOddWare {
    async fn around_item(
        &self,
        mut get: Getter,
        put: Putter,
        next: ItemNext<'_>,
    ) -> Result<tributary::Flow, FlowError> {
        let data = get.get().await;
        if let StreamData::Item(Value::Int(n)) = &data {
            if n % 2 == 1 {
                return Ok(tributary::Flow::Continue);
            }
        }
        next.run(Getter::of(data), put).await
    }
}

#[tokio::test]
async fn test_item_ware_can_drop_items_and_still_complete() {
    let middleware = Middleware::new().with_item(DropOddWare);
    let builder = FlowBuilder::new().with_middleware(middleware);
    let rx = builder.values([1, 2, 3, 4]).collect().receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(
        drain(rx).await,
        vec![Value::list([2, 4])],
        "odd items never reach the collector"
    );
}

/// Substitutes a putter that rewrites every forwarded item.
struct StampingPut {
    inner: Putter,
}

#[async_trait]
impl Put for StampingPut {
    async fn put(&self, data: StreamData, index: Option<usize>) -> Result<(), FlowError> {
        let stamped = match data {
            StreamData::Item(v) => StreamData::Item(Value::list([v, Value::from("stamped")])),
            end => end,
        };
        self.inner.put(stamped, index).await
    }
}

struct StampWare;

#[async_trait]
impl ItemWare for StampWare {
    async fn around_item(
        &self,
        get: Getter,
        put: Putter,
        next: ItemNext<'_>,
    ) -> Result<tributary::Flow, FlowError> {
        let adapted: Putter = Arc::new(StampingPut { inner: put });
        next.run(get, adapted).await
    }
}

#[tokio::test]
async fn test_item_ware_substitutes_the_putter() {
    let middleware = Middleware::new().with_item(StampWare);
    let builder = FlowBuilder::new().with_middleware(middleware);
    let rx = builder.values([7]).receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(
        drain(rx).await,
        vec![Value::list([Value::Int(7), Value::from("stamped")])]
    );
}

static SHARED_RESOURCE: OnceCell<String> = OnceCell::new();
static RESOURCE_INITS: AtomicUsize = AtomicUsize::new(0);

struct LazyResourceWare;

#[async_trait]
impl ExecuteWare for LazyResourceWare {
    async fn around_execute(
        &self,
        info: &StageInfo,
        next: ExecNext<'_>,
    ) -> Result<(), FlowError> {
        SHARED_RESOURCE.get_or_init(|| {
            RESOURCE_INITS.fetch_add(1, Ordering::SeqCst);
            "connection".to_string()
        });
        next.run(info).await
    }
}

#[tokio::test]
async fn test_execute_ware_establishes_shared_resource_once() {
    let middleware = Middleware::new().with_execute(LazyResourceWare);
    let builder = FlowBuilder::new().with_middleware(middleware);
    let rx = builder
        .values([1, 2])
        .map(|v| Ok(v))
        .count()
        .receiver();
    builder.build().expect("build flow").run().await.expect("run flow");
    assert_eq!(drain(rx).await, vec![Value::Int(2)]);

    assert_eq!(SHARED_RESOURCE.get(), Some(&"connection".to_string()));
    assert_eq!(
        RESOURCE_INITS.load(Ordering::SeqCst),
        1,
        "three stages share a single initialization"
    );
}

struct FailingBuildWare;

impl BuildWare for FailingBuildWare {
    fn on_build(&self, _seed: &mut StageSeed, _next: BuildNext<'_>) -> Result<(), FlowError> {
        Err(FlowError::config("stage rejected"))
    }
}

#[tokio::test]
async fn test_build_ware_failure_fails_the_build() {
    let middleware = Middleware::new().with_build(FailingBuildWare);
    let builder = FlowBuilder::new().with_middleware(middleware);
    builder.values([1]);
    let err = builder.build().expect_err("build ware error must surface");
    assert!(matches!(err, FlowError::InvalidConfiguration(_)));
}
