//! Error types shared across the dataflow runtime.

/// Errors raised while building or running a flow.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowError {
    /// The graph or a stage was configured in a way that can never run.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A branch routing function returned an index with no matching output.
    #[error("branch index {index} out of range for {outputs} outputs")]
    RouteOutOfRange { index: usize, outputs: usize },
    /// The completion marker was emitted twice on the same channel.
    #[error("completion marker already sent on channel {0}")]
    EndAlreadySent(String),
    /// A user-supplied callable (predicate, map, key or fold function) failed.
    #[error("user callable failed: {0}")]
    User(String),
    /// A stage hit a state it cannot process (malformed item, lost worker).
    #[error("processing error: {0}")]
    Processing(String),
}

impl FlowError {
    /// Wrap a user callable failure.
    pub fn user(msg: impl std::fmt::Display) -> Self {
        FlowError::User(msg.to_string())
    }

    /// Build an `InvalidConfiguration` error.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        FlowError::InvalidConfiguration(msg.to_string())
    }

    /// Build a `Processing` error.
    pub fn processing(msg: impl std::fmt::Display) -> Self {
        FlowError::Processing(msg.to_string())
    }
}
