use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Multiplexing key for bus events.
///
/// `Error` is not user-selectable through run options; the loop uses it for
/// the terminal error event, which is delivered to every subscriber
/// regardless of mode filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Full output-channel projection after each superstep's writes apply.
    Values,
    /// Per-task `{node: writes}` deltas as tasks complete.
    Updates,
    /// Planner and loop internals: planned tasks, commits, skips.
    Debug,
    /// Message payloads emitted by nodes through their context.
    Messages,
    /// Arbitrary payloads emitted by nodes through their context.
    Custom,
    /// Checkpoint commit records.
    Checkpoints,
    /// Task lifecycle records (start, finish, error, interrupt).
    Tasks,
    /// Node lifecycle events.
    Events,
    /// Terminal error record; always delivered, never selectable.
    Error,
}

impl StreamMode {
    /// Modes a caller may request through run options.
    pub const SELECTABLE: &'static [StreamMode] = &[
        StreamMode::Values,
        StreamMode::Updates,
        StreamMode::Debug,
        StreamMode::Messages,
        StreamMode::Custom,
        StreamMode::Checkpoints,
        StreamMode::Tasks,
        StreamMode::Events,
    ];
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Debug => "debug",
            StreamMode::Messages => "messages",
            StreamMode::Custom => "custom",
            StreamMode::Checkpoints => "checkpoints",
            StreamMode::Tasks => "tasks",
            StreamMode::Events => "events",
            StreamMode::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// One bus event: `(namespace, mode, payload)`.
///
/// `namespace` is the subgraph path (empty for the root graph, segments
/// joined with [`crate::types::NS_SEP`]). Events for a given
/// `(namespace, mode)` pair are delivered in production order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub namespace: String,
    pub mode: StreamMode,
    pub payload: Value,
}

impl StreamEvent {
    #[must_use]
    pub fn new(namespace: impl Into<String>, mode: StreamMode, payload: Value) -> Self {
        Self {
            namespace: namespace.into(),
            mode,
            payload,
        }
    }
}

impl std::fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "[{}] {}", self.mode, self.payload)
        } else {
            write!(f, "[{}/{}] {}", self.namespace, self.mode, self.payload)
        }
    }
}
