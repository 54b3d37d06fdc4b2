//! Node execution contract.
//!
//! A node is an arbitrary async unit of user code: it receives its input
//! projection and an execution context, and returns either plain channel
//! updates or a [`Command`]. Scheduling, retries, write buffering, and
//! interrupts all belong to the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, GraphInterrupt};
use crate::store::Store;
use crate::stream::{StreamEmitter, StreamMode};

/// One channel write produced by a task.
pub type ChannelWrite = (String, Value);

/// Core trait for executable graph nodes.
///
/// Nodes should be deterministic: replay equality (identical final state when
/// re-running a recorded trace) is only guaranteed for deterministic bodies.
/// Node-internal concurrency is fine, but all effects must flow through the
/// returned writes.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// A node's return value.
#[derive(Clone, Debug)]
pub enum NodeOutput {
    /// Plain channel updates, applied through reducers at the barrier.
    Updates(Vec<ChannelWrite>),
    /// Structured command: updates plus routing / resume intent.
    Command(Command),
}

impl NodeOutput {
    #[must_use]
    pub fn empty() -> Self {
        NodeOutput::Updates(Vec::new())
    }

    /// Single-write convenience.
    #[must_use]
    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeOutput::Updates(vec![(channel.into(), value)])
    }

    #[must_use]
    pub fn updates<I>(writes: I) -> Self
    where
        I: IntoIterator<Item = ChannelWrite>,
    {
        NodeOutput::Updates(writes.into_iter().collect())
    }

    #[must_use]
    pub fn command(command: Command) -> Self {
        NodeOutput::Command(command)
    }
}

/// Execution context passed to a node for one attempt of one task.
///
/// The interrupt counter restarts on every attempt, so retried tasks replay
/// resume values in the order the interrupts were originally raised.
#[derive(Clone, Debug)]
pub struct NodeContext {
    task_id: String,
    node: String,
    step: i64,
    resume_values: Arc<Vec<Value>>,
    interrupt_counter: Arc<AtomicUsize>,
    emitter: StreamEmitter,
    store: Option<Arc<dyn Store>>,
    cancel: CancellationToken,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task_id: String,
        node: String,
        step: i64,
        resume_values: Arc<Vec<Value>>,
        emitter: StreamEmitter,
        store: Option<Arc<dyn Store>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            node,
            step,
            resume_values,
            interrupt_counter: Arc::new(AtomicUsize::new(0)),
            emitter,
            store,
            cancel,
        }
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    #[must_use]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Cooperative pause point.
    ///
    /// If this task already carries a resume value for the current interrupt
    /// ordinal, it is returned and execution proceeds. Otherwise the call
    /// raises [`NodeError::Interrupt`], which the runner records durably; the
    /// node re-runs from the top once the caller resumes the graph.
    pub fn interrupt(&self, payload: Value) -> Result<Value, NodeError> {
        let index = self.interrupt_counter.fetch_add(1, Ordering::SeqCst);
        if let Some(value) = self.resume_values.get(index) {
            return Ok(value.clone());
        }
        Err(NodeError::Interrupt(GraphInterrupt::single(
            payload,
            self.task_id.clone(),
            index,
        )))
    }

    /// Emit a `custom` stream event (back-pressured).
    pub async fn emit_custom(&self, payload: Value) {
        self.emitter.emit(StreamMode::Custom, payload).await;
    }

    /// Emit a `messages` stream event (back-pressured).
    pub async fn emit_message(&self, payload: Value) {
        self.emitter.emit(StreamMode::Messages, payload).await;
    }

    /// Long-term store bound to the invocation, if any.
    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    /// True once the run has been cancelled; long-running nodes should poll
    /// this (or select on [`NodeContext::cancelled`]) and unwind.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Errors (and control-flow signals) produced by node execution.
///
/// `Interrupt` and `ParentCommand` are not failures: the runner converts the
/// former into a durable pause and propagates the latter to the enclosing
/// graph. Every other variant is retried per the task's [`RetryPolicy`] and
/// then surfaced as an `__error__` pending write.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Cooperative pause carrying interrupt payloads.
    #[error("{0}")]
    #[diagnostic(code(stepweave::node::interrupt))]
    Interrupt(GraphInterrupt),

    /// Command addressed to the enclosing graph.
    #[error("parent command propagated")]
    #[diagnostic(code(stepweave::node::parent_command))]
    ParentCommand(Box<Command>),

    /// Expected input data missing from the projection.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stepweave::node::missing_input),
        help("Check that an upstream node wrote the required channel: {what}.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stepweave::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON (de)serialization error inside the node body.
    #[error(transparent)]
    #[diagnostic(code(stepweave::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(stepweave::node::validation))]
    ValidationFailed(String),

    /// Anything else.
    #[error("node failed: {0}")]
    #[diagnostic(code(stepweave::node::other))]
    Other(String),
}

impl NodeError {
    /// Control-flow signals must never be retried or converted to error
    /// writes.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(self, NodeError::Interrupt(_) | NodeError::ParentCommand(_))
    }
}

/// Per-task retry policy with exponential backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub jitter: bool,
    /// Predicate deciding whether a given failure is retriable.
    pub retry_on: Arc<dyn Fn(&NodeError) -> bool + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(128),
            jitter: true,
            retry_on: Arc::new(|error| !error.is_control_flow()),
        }
    }
}

impl RetryPolicy {
    /// Fixed attempt count with default backoff.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Backoff delay before retrying after `attempt` (1-based) failed.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_interval.as_secs_f64() * factor;
        let capped = base.min(self.max_interval.as_secs_f64());
        let with_jitter = if self.jitter {
            capped * rand::random_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(with_jitter.max(0.0))
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// Task memoization policy: when set on a node, the runner consults the bound
/// cache before executing and replays the cached writes on a hit.
#[derive(Clone)]
pub struct CachePolicy {
    /// Time-to-live for cached entries; `None` never expires.
    pub ttl: Option<Duration>,
    /// Custom key derivation from the task input; defaults to a stable hash
    /// of the canonical JSON serialization.
    pub key_fn: Option<Arc<dyn Fn(&Value) -> String + Send + Sync>>,
}

impl CachePolicy {
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { ttl, key_fn: None }
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "custom"))
            .finish()
    }
}
