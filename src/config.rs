//! Flow-level configuration.

/// Tuning knobs applied when a flow graph is built.
///
/// Output edges are bounded; the capacity here is the sole flow-control
/// mechanism. A slow consumer stalls the producing stage's `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Buffer capacity of every channel edge.
    pub channel_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl FlowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}
