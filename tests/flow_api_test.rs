use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use tributary::{
    Flow, FlowBuilder, FlowConfig, FlowError, ItemCtx, ItemHandler, Predicate, StageLogic,
    StreamData, Subscribe, Value,
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

#[tokio::test]
async fn test_fluent_chain_end_to_end() {
    let builder = FlowBuilder::new();
    let rx = builder
        .values(1..=20)
        .filter(Predicate::func(|v| {
            Ok(v.as_int().is_some_and(|n| n % 3 == 0))
        }))
        .map(|v| match v {
            Value::Int(n) => Ok(Value::Int(n * n)),
            other => Ok(other),
        })
        .take(4)
        .collect()
        .receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(drain(rx).await, vec![Value::list([9, 36, 81, 144])]);
}

#[tokio::test]
async fn test_mid_chain_tap_sees_intermediate_stream() {
    let builder = FlowBuilder::new();
    let doubled = builder.values([1, 2, 3]).map(|v| match v {
        Value::Int(n) => Ok(Value::Int(n * 2)),
        other => Ok(other),
    });
    let tap_rx = doubled.receiver();
    let sum_rx = doubled.sum().receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(
        drain(tap_rx).await,
        vec![Value::Int(2), Value::Int(4), Value::Int(6)]
    );
    assert_eq!(drain(sum_rx).await, vec![Value::Int(12)]);
}

struct Doubler;

#[async_trait]
impl ItemHandler for Doubler {
    async fn on_item(&mut self, item: Value, ctx: &ItemCtx<'_>) -> Result<Flow, FlowError> {
        match item {
            Value::Int(n) => ctx.put(Value::Int(n * 2)).await?,
            other => ctx.put(other).await?,
        }
        Ok(Flow::Continue)
    }
}

#[tokio::test]
async fn test_custom_stage_runs_managed() {
    let builder = FlowBuilder::new();
    let rx = builder
        .values([10, 20])
        .then("doubler", StageLogic::per_item(Doubler))
        .receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(drain(rx).await, vec![Value::Int(20), Value::Int(40)]);
}

#[tokio::test]
async fn test_subscribe_observes_items_and_completion() {
    let next_calls = Arc::new(AtomicUsize::new(0));
    let complete_calls = Arc::new(AtomicUsize::new(0));
    let on_next_calls = next_calls.clone();
    let on_complete_calls = complete_calls.clone();

    let builder = FlowBuilder::new();
    let rx = builder
        .values([1, 2, 3])
        .subscribe(
            Subscribe::new()
                .on_next(move |_| {
                    on_next_calls.fetch_add(1, Ordering::SeqCst);
                })
                .on_complete(move || {
                    on_complete_calls.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(
        drain(rx).await,
        vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        "subscribe is a pass-through"
    );
    assert_eq!(next_calls.load(Ordering::SeqCst), 3);
    assert_eq!(complete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tiny_channel_capacity_still_completes() {
    let builder = FlowBuilder::new().with_config(FlowConfig::default().with_channel_capacity(1));
    let rx = builder.values(0..50).sum().receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(drain(rx).await, vec![Value::Int(1225)]);
}

#[tokio::test]
async fn test_diamond_topology() {
    // One source fanned out to two transforms, mixed back together.
    let builder = FlowBuilder::new();
    let source = builder.values([1, 2, 3]);
    let plus = source.map(|v| match v {
        Value::Int(n) => Ok(Value::Int(n + 100)),
        other => Ok(other),
    });
    let minus = source.map(|v| match v {
        Value::Int(n) => Ok(Value::Int(n - 100)),
        other => Ok(other),
    });
    let rx = plus.mix_with(&minus).receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    let mut mixed = drain(rx).await;
    mixed.sort();
    assert_eq!(
        mixed,
        vec![
            Value::Int(-99),
            Value::Int(-98),
            Value::Int(-97),
            Value::Int(101),
            Value::Int(102),
            Value::Int(103),
        ]
    );
}

#[tokio::test]
async fn test_stage_count_reflects_graph_size() {
    let builder = FlowBuilder::new();
    builder.values([1]).map(|v| Ok(v)).count();
    let pipeline = builder.build().expect("build flow");
    assert_eq!(pipeline.stage_count(), 3);
    pipeline.run().await.expect("run flow");
}

#[tokio::test]
async fn test_dropped_tap_does_not_stall_the_flow() {
    let builder = FlowBuilder::new();
    let stream = builder.values(0..10).map(|v| Ok(v));
    let tap = stream.receiver();
    drop(tap);
    let rx = stream.count().receiver();
    builder.build().expect("build flow").run().await.expect("run flow");

    assert_eq!(drain(rx).await, vec![Value::Int(10)]);
}
