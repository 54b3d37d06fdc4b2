//! Control-flow values exchanged between nodes and the loop.
//!
//! Commands are kept separate from plain channel updates so a node can
//! express routing intent (`goto`) or interrupt resumption (`resume`) without
//! mutating state directly. The loop records them as pending writes and
//! reconciles them deterministically at the next superstep boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dynamic task: direct-dispatch `node` in the next superstep with `input`,
/// regardless of channel subscriptions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Send {
    pub node: String,
    pub input: Value,
}

impl Send {
    #[must_use]
    pub fn new(node: impl Into<String>, input: Value) -> Self {
        Self {
            node: node.into(),
            input,
        }
    }
}

/// A node's structured return value, or the caller's resume envelope.
///
/// `update` flows through channel reducers like any write; `goto` enqueues
/// [`Send`]s for the next superstep; `resume` injects a value into a blocking
/// interrupt.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Command {
    #[serde(default)]
    pub update: Vec<(String, Value)>,
    #[serde(default)]
    pub goto: Vec<Send>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
}

impl Command {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_update(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.update.push((channel.into(), value));
        self
    }

    #[must_use]
    pub fn with_goto(mut self, send: Send) -> Self {
        self.goto.push(send);
        self
    }

    /// Resume envelope for re-invoking an interrupted graph.
    #[must_use]
    pub fn resume(value: Value) -> Self {
        Self {
            resume: Some(value),
            ..Self::default()
        }
    }
}

/// One durable interrupt record, identified by `(task_id, index)`.
///
/// The index is the ordinal of the `interrupt()` call within its task, which
/// makes re-invocation idempotent: replaying a task consumes resume values in
/// the same order it raised interrupts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InterruptValue {
    pub value: Value,
    pub task_id: String,
    pub index: usize,
}

/// Cooperative pause raised inside a task. Not a failure: the runner records
/// it as a checkpointed write and the graph halts until resumed.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphInterrupt {
    pub interrupts: Vec<InterruptValue>,
}

impl GraphInterrupt {
    #[must_use]
    pub fn single(value: Value, task_id: impl Into<String>, index: usize) -> Self {
        Self {
            interrupts: vec![InterruptValue {
                value,
                task_id: task_id.into(),
                index,
            }],
        }
    }
}

impl std::fmt::Display for GraphInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "graph interrupted ({} payload(s))", self.interrupts.len())
    }
}

/// Input accepted by `invoke`/`stream`.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphInput {
    /// Fresh input: a JSON object mapping input channels to seed values.
    Values(Value),
    /// Structured envelope, typically `Command::resume`.
    Command(Command),
    /// No new input: proceed from the latest committed checkpoint.
    Empty,
}

impl From<Value> for GraphInput {
    fn from(value: Value) -> Self {
        GraphInput::Values(value)
    }
}

impl From<Command> for GraphInput {
    fn from(command: Command) -> Self {
        GraphInput::Command(command)
    }
}
