//! Node implementations shared across integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use stepweave::command::{Command, Send as SendPayload};
use stepweave::node::{Node, NodeContext, NodeError, NodeOutput};

/// Writes `amount` to the `count` channel and counts its own executions.
pub struct IncrementNode {
    pub amount: i64,
    pub runs: Arc<AtomicUsize>,
}

impl IncrementNode {
    pub fn new(amount: i64) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                amount,
                runs: Arc::clone(&runs),
            },
            runs,
        )
    }
}

#[async_trait]
impl Node for IncrementNode {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::write("count", json!(self.amount)))
    }
}

/// Writes a fixed set of channel writes.
pub struct WriteNode {
    pub writes: Vec<(String, Value)>,
}

#[async_trait]
impl Node for WriteNode {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::updates(self.writes.clone()))
    }
}

/// Interrupts with `"confirm?"`, then writes the resume value to `answer`.
pub struct AskNode;

#[async_trait]
impl Node for AskNode {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let answer = ctx.interrupt(json!("confirm?"))?;
        Ok(NodeOutput::write("answer", answer))
    }
}

/// Copies its input projection into the named channel.
pub struct EchoNode {
    pub channel: String,
}

#[async_trait]
impl Node for EchoNode {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::write(self.channel.clone(), input))
    }
}

/// Fails `failures` times with a provider error, then writes `count = 1`.
pub struct FlakyNode {
    pub failures: Arc<AtomicUsize>,
    pub attempts: Arc<AtomicUsize>,
}

impl FlakyNode {
    pub fn new(failures: usize) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                failures: Arc::new(AtomicUsize::new(failures)),
                attempts: Arc::clone(&attempts),
            },
            attempts,
        )
    }
}

#[async_trait]
impl Node for FlakyNode {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(NodeError::Provider {
                provider: "flaky",
                message: format!("transient failure, {remaining} left"),
            });
        }
        Ok(NodeOutput::write("count", json!(1)))
    }
}

/// Sleeps for `delay` before writing; used for timeout and cancellation
/// tests.
pub struct SlowNode {
    pub delay: Duration,
    pub completed: Arc<AtomicUsize>,
}

impl SlowNode {
    pub fn new(delay: Duration) -> (Self, Arc<AtomicUsize>) {
        let completed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                delay,
                completed: Arc::clone(&completed),
            },
            completed,
        )
    }
}

#[async_trait]
impl Node for SlowNode {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::write("count", json!(1)))
    }
}

/// Fans each element of the `jobs` input out to `worker` via dynamic sends.
pub struct DispatchNode;

#[async_trait]
impl Node for DispatchNode {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let jobs = input.as_array().cloned().unwrap_or_default();
        let mut command = Command::new();
        for job in jobs {
            command = command.with_goto(SendPayload::new("worker", job));
        }
        Ok(NodeOutput::command(command))
    }
}

/// Emits custom stream events while running.
pub struct ChattyNode;

#[async_trait]
impl Node for ChattyNode {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.emit_custom(json!({"progress": 0.5})).await;
        ctx.emit_message(json!({"role": "assistant", "content": "working"}))
            .await;
        Ok(NodeOutput::write("count", json!(1)))
    }
}
