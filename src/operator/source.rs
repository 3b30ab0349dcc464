//! Source stages feeding a flow from in-memory data.

use async_trait::async_trait;

use crate::channel::StreamData;
use crate::error::FlowError;
use crate::stage::{StageIo, StreamHandler};
use crate::value::Value;

/// Emits a fixed sequence of values followed by the completion marker.
///
/// Backpressure applies: a slow consumer stalls the source between emits.
pub struct ValuesSource {
    items: Vec<Value>,
}

impl ValuesSource {
    pub fn new<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl StreamHandler for ValuesSource {
    async fn handle_stream(&mut self, io: &mut StageIo<'_>) -> Result<(), FlowError> {
        for value in self.items.drain(..) {
            io.emit_item(value).await?;
        }
        io.emit(StreamData::End).await
    }
}
