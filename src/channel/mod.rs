//! Channels, queues and consumers: the asynchronous pipes between stages.
//!
//! A [`Channel`] is a named conduit owned by exactly one producing stage.
//! Every consuming stage (and every external tap) gets its own bounded queue,
//! so each attached consumer observes the full element stream. The bounded
//! buffer is the sole flow-control mechanism: a slow consumer stalls the
//! producer's `put`.
//!
//! Constant channels store exactly one committed value and replay
//! `{value, End}` to every attached queue; they are exempt from the
//! single-pass rule.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::mpsc;

use crate::error::FlowError;
use crate::value::Value;

/// One element on a channel: a payload item or the completion marker.
///
/// `End` is terminal on its edge. Reading past it keeps yielding `End`;
/// writing it twice on the same channel is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamData {
    Item(Value),
    End,
}

impl StreamData {
    pub fn item(value: impl Into<Value>) -> Self {
        StreamData::Item(value.into())
    }

    pub fn is_end(&self) -> bool {
        matches!(self, StreamData::End)
    }

    pub fn as_item(&self) -> Option<&Value> {
        match self {
            StreamData::Item(v) => Some(v),
            StreamData::End => None,
        }
    }

    pub fn into_item(self) -> Option<Value> {
        match self {
            StreamData::Item(v) => Some(v),
            StreamData::End => None,
        }
    }
}

/// Channel behaviour on the producing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Ordinary single-pass bounded channel.
    Buffered,
    /// Stores one committed value and replays `{value, End}` per consumer.
    Constant,
}

/// Shared core of one channel: the fan-out senders plus end-marker state.
pub(crate) struct ChannelCore {
    name: String,
    kind: ChannelKind,
    senders: Vec<mpsc::Sender<StreamData>>,
    end_sent: AtomicBool,
    /// Committed value, constant channels only.
    committed: Mutex<Option<Value>>,
}

impl ChannelCore {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: ChannelKind,
        senders: Vec<mpsc::Sender<StreamData>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            senders,
            end_sent: AtomicBool::new(false),
            committed: Mutex::new(None),
        }
    }

    /// Enqueue one element for every attached consumer.
    ///
    /// Edges whose consumer has detached (a self-terminated stage) silently
    /// drop the element; the rest of the graph keeps flowing.
    pub(crate) async fn put(&self, data: StreamData) -> Result<(), FlowError> {
        match self.kind {
            ChannelKind::Buffered => self.put_buffered(data).await,
            ChannelKind::Constant => self.put_constant(data).await,
        }
    }

    async fn put_buffered(&self, data: StreamData) -> Result<(), FlowError> {
        if data.is_end() {
            if self.end_sent.swap(true, Ordering::SeqCst) {
                return Err(FlowError::EndAlreadySent(self.name.clone()));
            }
        } else if self.end_sent.load(Ordering::SeqCst) {
            return Err(FlowError::EndAlreadySent(self.name.clone()));
        }
        self.fan_out(data).await;
        Ok(())
    }

    async fn put_constant(&self, data: StreamData) -> Result<(), FlowError> {
        match data {
            StreamData::Item(value) => {
                {
                    let mut slot = self.committed.lock().expect("constant channel poisoned");
                    if slot.is_some() {
                        return Err(FlowError::config(format!(
                            "constant channel {} already committed",
                            self.name
                        )));
                    }
                    *slot = Some(value.clone());
                }
                self.end_sent.store(true, Ordering::SeqCst);
                self.fan_out(StreamData::Item(value)).await;
                self.fan_out(StreamData::End).await;
                Ok(())
            }
            // The producing stage forwards End after committing; the marker
            // was already replayed alongside the value.
            StreamData::End => {
                if !self.end_sent.swap(true, Ordering::SeqCst) {
                    self.fan_out(StreamData::End).await;
                }
                Ok(())
            }
        }
    }

    async fn fan_out(&self, data: StreamData) {
        if let Some((last, rest)) = self.senders.split_last() {
            for sender in rest {
                if sender.send(data.clone()).await.is_err() {
                    tracing::trace!(channel = %self.name, "consumer detached, dropping element");
                }
            }
            if last.send(data).await.is_err() {
                tracing::trace!(channel = %self.name, "consumer detached, dropping element");
            }
        }
    }

    /// Commit the preset value of a constant channel during graph build.
    ///
    /// Only called on freshly created queues, so the reserved capacity of two
    /// slots per edge is always available.
    pub(crate) fn commit_initial(&self, value: Value) {
        {
            let mut slot = self.committed.lock().expect("constant channel poisoned");
            *slot = Some(value.clone());
        }
        self.end_sent.store(true, Ordering::SeqCst);
        for sender in &self.senders {
            if sender.try_send(StreamData::Item(value.clone())).is_err()
                || sender.try_send(StreamData::End).is_err()
            {
                tracing::trace!(channel = %self.name, "consumer detached during preset commit");
            }
        }
    }
}

/// One consumer's cursor into one channel.
///
/// `get` suspends until the next element is ready; after `End` it keeps
/// returning `End`. A closed edge without an explicit marker also reads as
/// `End`, so an aborted upstream stage drains downstream cleanly.
pub struct Queue {
    rx: mpsc::Receiver<StreamData>,
    channel_name: String,
    kind: ChannelKind,
    ended: bool,
}

impl Queue {
    pub(crate) fn new(
        rx: mpsc::Receiver<StreamData>,
        channel_name: impl Into<String>,
        kind: ChannelKind,
    ) -> Self {
        Self {
            rx,
            channel_name: channel_name.into(),
            kind,
            ended: false,
        }
    }

    /// Name of the channel this queue reads from.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Kind of the originating channel, so operators can reject constant
    /// sources where replay semantics would be wrong (Mix).
    pub fn channel_kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Await the next element.
    pub async fn get(&mut self) -> StreamData {
        poll_fn(|cx| self.poll_get(cx)).await
    }

    pub(crate) fn poll_get(&mut self, cx: &mut Context<'_>) -> Poll<StreamData> {
        if self.ended {
            return Poll::Ready(StreamData::End);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamData::End)) | Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(StreamData::End)
            }
            Poll::Ready(Some(item)) => Poll::Ready(item),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Ordered set of queues forming one stage's logical input.
///
/// `get` merges the queues round-robin, resuming after the last queue that
/// produced an element, and yields `End` exactly once after every queue has
/// ended. Whole-stream operators that need per-queue control (Merge, Mix,
/// Concat) take the queues out instead.
pub struct Consumer {
    queues: Vec<Queue>,
    cursor: usize,
    done: bool,
}

impl Consumer {
    pub(crate) fn new(queues: Vec<Queue>) -> Self {
        Self {
            queues,
            cursor: 0,
            done: false,
        }
    }

    /// Consumer with no inputs, yields `End` immediately (source stages).
    pub(crate) fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Hand the underlying queues to the caller, leaving the consumer empty.
    pub fn take_queues(&mut self) -> Vec<Queue> {
        self.done = true;
        std::mem::take(&mut self.queues)
    }

    /// Await the next element from the merged inputs.
    pub async fn get(&mut self) -> StreamData {
        if self.done || self.queues.is_empty() {
            self.done = true;
            return StreamData::End;
        }
        let data = poll_fn(|cx| {
            let n = self.queues.len();
            for k in 0..n {
                let i = (self.cursor + k) % n;
                if self.queues[i].ended {
                    continue;
                }
                match self.queues[i].poll_get(cx) {
                    // Queue marked itself ended, keep scanning the rest.
                    Poll::Ready(StreamData::End) => {}
                    Poll::Ready(item) => {
                        self.cursor = (i + 1) % n;
                        return Poll::Ready(item);
                    }
                    Poll::Pending => {}
                }
            }
            if self.queues.iter().all(|q| q.ended) {
                Poll::Ready(StreamData::End)
            } else {
                Poll::Pending
            }
        })
        .await;
        if data.is_end() {
            self.done = true;
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(capacity: usize) -> (ChannelCore, Queue) {
        let (tx, rx) = mpsc::channel(capacity);
        let core = ChannelCore::new("ch", ChannelKind::Buffered, vec![tx]);
        (core, Queue::new(rx, "ch", ChannelKind::Buffered))
    }

    #[tokio::test]
    async fn queue_end_is_sticky() {
        let (core, mut queue) = edge(8);
        core.put(StreamData::item(1)).await.expect("put item");
        core.put(StreamData::End).await.expect("put end");

        assert_eq!(queue.get().await, StreamData::item(1));
        assert_eq!(queue.get().await, StreamData::End);
        assert_eq!(queue.get().await, StreamData::End);
        assert!(queue.has_ended());
    }

    #[tokio::test]
    async fn double_end_is_rejected() {
        let (core, _queue) = edge(8);
        core.put(StreamData::End).await.expect("first end");
        let err = core.put(StreamData::End).await.unwrap_err();
        assert!(matches!(err, FlowError::EndAlreadySent(_)));
    }

    #[tokio::test]
    async fn closed_edge_reads_as_end() {
        let (core, mut queue) = edge(8);
        drop(core);
        assert_eq!(queue.get().await, StreamData::End);
    }

    #[tokio::test]
    async fn constant_channel_replays_to_every_consumer() {
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let core = ChannelCore::new("const", ChannelKind::Constant, vec![tx_a, tx_b]);
        core.put(StreamData::item("x")).await.expect("commit");
        // The producing stage forwards End after the commit; it is absorbed.
        core.put(StreamData::End).await.expect("end after commit");

        for rx in [rx_a, rx_b] {
            let mut queue = Queue::new(rx, "const", ChannelKind::Constant);
            assert_eq!(queue.get().await, StreamData::item("x"));
            assert_eq!(queue.get().await, StreamData::End);
        }
    }

    #[tokio::test]
    async fn constant_channel_rejects_second_commit() {
        let core = ChannelCore::new("const", ChannelKind::Constant, Vec::new());
        core.put(StreamData::item(1)).await.expect("first commit");
        let err = core.put(StreamData::item(2)).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn consumer_merges_until_all_inputs_end() {
        let (core_a, queue_a) = edge(8);
        let (core_b, queue_b) = edge(8);
        let mut consumer = Consumer::new(vec![queue_a, queue_b]);

        core_a.put(StreamData::item(1)).await.expect("put");
        core_a.put(StreamData::End).await.expect("end");
        core_b.put(StreamData::item(2)).await.expect("put");
        core_b.put(StreamData::End).await.expect("end");

        let mut seen = Vec::new();
        loop {
            match consumer.get().await {
                StreamData::End => break,
                StreamData::Item(v) => seen.push(v),
            }
        }
        seen.sort();
        assert_eq!(seen, vec![Value::Int(1), Value::Int(2)]);
        // End is sticky on the consumer as well.
        assert_eq!(consumer.get().await, StreamData::End);
    }

    #[tokio::test]
    async fn empty_consumer_ends_immediately() {
        let mut consumer = Consumer::empty();
        assert_eq!(consumer.get().await, StreamData::End);
    }
}
