//! Concurrent task execution for one superstep.
//!
//! The executor is a bounded worker pool: planned tasks run in parallel up
//! to `max_concurrency`, each with its own retry policy, write buffer, and
//! interrupt capture. Workers report through a funnel channel so the
//! supervisor can keep collecting results while it cancels stragglers on
//! timeout. Tasks within a superstep never observe each other's writes; all
//! effects are buffered and persisted as pending writes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::checkpoint::{CheckpointConfig, Checkpointer, PendingWrite};
use crate::command::{Command, InterruptValue};
use crate::graph::GraphSpec;
use crate::node::{ChannelWrite, NodeContext, NodeError, NodeOutput, RetryPolicy};
use crate::store::{Cache, Store};
use crate::stream::{StreamBus, StreamMode};
use crate::types::{self, NO_WRITES, TASKS};

use super::planner::Task;
use super::SchedulerError;

/// Everything a superstep's workers need, bundled once per step.
#[derive(Clone)]
pub struct StepContext {
    pub step: i64,
    pub namespace: String,
    /// Config of the checkpoint this step's writes attach to.
    pub checkpoint_config: CheckpointConfig,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    pub cache: Option<Arc<dyn Cache>>,
    pub store: Option<Arc<dyn Store>>,
    pub bus: StreamBus,
    pub cancel: CancellationToken,
    pub max_concurrency: usize,
    pub step_timeout: Option<Duration>,
}

/// Terminal state of one task in one superstep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Node ran to completion.
    Success,
    /// Writes served from the task cache without invoking the node.
    Cached,
    /// Writes replayed from pending writes of a prior (crashed) attempt.
    Replayed,
    /// Node raised an interrupt; the task is paused, not failed.
    Paused,
    /// Retries exhausted; error recorded as an `__error__` write.
    Failed { message: String },
    /// Cancelled cooperatively; buffered writes were discarded.
    Cancelled,
}

/// Outcome of one task.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub task_id: String,
    pub name: String,
    /// Buffered writes that become pending writes (empty for cancelled
    /// tasks).
    pub writes: Vec<ChannelWrite>,
    pub status: TaskStatus,
    pub interrupts: Vec<InterruptValue>,
    pub parent_command: Option<Command>,
}

/// Aggregate outcome of one superstep.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub results: Vec<TaskResult>,
    /// First parent command raised by any task, propagated upward.
    pub parent_command: Option<Command>,
    /// Interrupts raised this step, in deterministic task order.
    pub interrupts: Vec<InterruptValue>,
    pub cancelled: bool,
}

/// Execute all planned tasks for one superstep.
///
/// Replayed tasks (writes persisted by a prior attempt) are emitted without
/// re-running the node. Everything else goes through the pool. Returns once
/// every worker has finished, been cancelled, or the step timeout fired.
#[instrument(skip_all, fields(step = ctx.step, tasks = tasks.len()))]
pub async fn run_step(
    graph: &Arc<GraphSpec>,
    tasks: Vec<Task>,
    ctx: &StepContext,
) -> Result<StepOutcome, SchedulerError> {
    let mut outcome = StepOutcome::default();
    let mut order: Vec<String> = Vec::with_capacity(tasks.len());

    let (result_tx, result_rx) = flume::unbounded::<TaskResult>();
    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrency.max(1)));
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut spawned = 0usize;

    for task in tasks {
        order.push(task.id.clone());
        if let Some(cached) = task.cached_writes.clone() {
            // Prior attempt already persisted these; reuse instead of
            // re-running (at-most-once observed writes per task).
            outcome.results.push(TaskResult {
                task_id: task.id,
                name: task.name,
                writes: cached.into_iter().map(|w| (w.channel, w.value)).collect(),
                status: TaskStatus::Replayed,
                interrupts: Vec::new(),
                parent_command: None,
            });
            continue;
        }
        let graph = Arc::clone(graph);
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        let result_tx = result_tx.clone();
        spawned += 1;
        workers.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let result = run_task(&graph, task, &ctx).await;
            drop(permit);
            let _ = result_tx.send(result);
        });
    }
    drop(result_tx);

    let collect = async {
        let mut received = Vec::with_capacity(spawned);
        while received.len() < spawned {
            match result_rx.recv_async().await {
                Ok(result) => received.push(result),
                Err(_) => break,
            }
        }
        received
    };

    let mut timed_out = false;
    let mut received = match ctx.step_timeout {
        Some(budget) => match timeout(budget, collect).await {
            Ok(received) => received,
            Err(_) => {
                timed_out = true;
                ctx.cancel.cancel();
                Vec::new()
            }
        },
        None => collect.await,
    };

    // Let cancelled workers unwind, then drain whatever they reported.
    while workers.join_next().await.is_some() {}
    while let Ok(result) = result_rx.try_recv() {
        received.push(result);
    }
    outcome.results.extend(received);

    if timed_out {
        return Err(SchedulerError::StepTimeout { step: ctx.step });
    }

    // Deterministic order for downstream consumers: planner task order.
    outcome
        .results
        .sort_by_key(|result| order.iter().position(|id| id == &result.task_id));

    for result in &outcome.results {
        outcome.interrupts.extend(result.interrupts.iter().cloned());
        if outcome.parent_command.is_none() {
            outcome.parent_command = result.parent_command.clone();
        }
        if result.status == TaskStatus::Cancelled {
            outcome.cancelled = true;
        }
    }
    if ctx.cancel.is_cancelled() {
        outcome.cancelled = true;
    }
    Ok(outcome)
}

fn output_writes(output: NodeOutput) -> Vec<ChannelWrite> {
    let mut writes = match output {
        NodeOutput::Updates(writes) => writes,
        NodeOutput::Command(command) => {
            let mut writes = command.update;
            for send in command.goto {
                writes.push((TASKS.to_string(), json!(send)));
            }
            if let Some(resume) = command.resume {
                writes.push((types::RESUME.to_string(), resume));
            }
            writes
        }
    };
    if writes.is_empty() {
        // Marker so replay can tell "ran, wrote nothing" from "never ran".
        writes.push((NO_WRITES.to_string(), Value::Null));
    }
    writes
}

async fn persist_writes(task_id: &str, writes: &[ChannelWrite], ctx: &StepContext) {
    let Some(checkpointer) = &ctx.checkpointer else {
        return;
    };
    // No committed checkpoint to attach to (exit durability before the
    // first commit): writes stay in-memory only.
    if writes.is_empty() || ctx.checkpoint_config.checkpoint_id.is_none() {
        return;
    }
    let pending: Vec<PendingWrite> = writes
        .iter()
        .map(|(channel, value)| PendingWrite::new(task_id, channel.clone(), value.clone()))
        .collect();
    if let Err(err) = checkpointer
        .put_writes(&ctx.checkpoint_config, pending, task_id)
        .await
    {
        tracing::warn!(
            target: "stepweave::executor",
            task = task_id,
            error = %err,
            "failed to persist pending writes; crash replay will re-run this task"
        );
    }
}

async fn emit_task_events(result: &TaskResult, ctx: &StepContext) {
    let emitter = ctx.bus.emitter(ctx.namespace.clone());
    let status = match &result.status {
        TaskStatus::Success => json!("success"),
        TaskStatus::Cached => json!("cached"),
        TaskStatus::Replayed => json!("replayed"),
        TaskStatus::Paused => json!("interrupted"),
        TaskStatus::Failed { message } => json!({"error": message}),
        TaskStatus::Cancelled => json!("cancelled"),
    };
    emitter
        .emit(
            StreamMode::Tasks,
            json!({
                "id": result.task_id,
                "name": result.name,
                "step": ctx.step,
                "result": status,
            }),
        )
        .await;

    if matches!(result.status, TaskStatus::Success | TaskStatus::Cached) {
        let mut writes = Map::new();
        for (channel, value) in &result.writes {
            if !types::is_sentinel_channel(channel) {
                writes.insert(channel.clone(), value.clone());
            }
        }
        let mut payload = Map::new();
        payload.insert(result.name.clone(), Value::Object(writes));
        emitter.emit(StreamMode::Updates, Value::Object(payload)).await;
    }
}

async fn run_task(graph: &Arc<GraphSpec>, task: Task, ctx: &StepContext) -> TaskResult {
    let emitter = ctx.bus.emitter(ctx.namespace.clone());
    emitter
        .emit(
            StreamMode::Events,
            json!({"event": "task_start", "id": task.id, "name": task.name, "step": ctx.step}),
        )
        .await;

    let result = execute_with_retries(graph, &task, ctx).await;

    if result.status != TaskStatus::Cancelled {
        persist_writes(&result.task_id, &result.writes, ctx).await;
        emit_task_events(&result, ctx).await;
    }
    result
}

async fn execute_with_retries(graph: &Arc<GraphSpec>, task: &Task, ctx: &StepContext) -> TaskResult {
    let Some(spec) = graph.node(&task.name) else {
        return TaskResult {
            task_id: task.id.clone(),
            name: task.name.clone(),
            writes: vec![(
                types::ERROR.to_string(),
                json!({"name": task.name, "message": "node not found in graph"}),
            )],
            status: TaskStatus::Failed {
                message: "node not found in graph".to_string(),
            },
            interrupts: Vec::new(),
            parent_command: None,
        };
    };

    // Cache lookup happens before the first attempt only.
    if let (Some(cache), Some(key)) = (&ctx.cache, &task.cache_key) {
        if let Ok(Some(writes)) = cache.get(key).await {
            return TaskResult {
                task_id: task.id.clone(),
                name: task.name.clone(),
                writes,
                status: TaskStatus::Cached,
                interrupts: Vec::new(),
                parent_command: None,
            };
        }
    }

    let policy = spec.retry_policy.clone();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        // Fresh context per attempt: the interrupt counter restarts and no
        // partial writes from prior attempts can leak.
        let node_ctx = NodeContext::new(
            task.id.clone(),
            task.name.clone(),
            ctx.step,
            Arc::new(task.resume_values.clone()),
            ctx.bus.emitter(ctx.namespace.clone()),
            ctx.store.clone(),
            ctx.cancel.clone(),
        );

        let run = spec.node.run(task.input.clone(), node_ctx);
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return TaskResult {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    writes: Vec::new(),
                    status: TaskStatus::Cancelled,
                    interrupts: Vec::new(),
                    parent_command: None,
                };
            }
            outcome = run => outcome,
        };

        match outcome {
            Ok(output) => {
                let writes = output_writes(output);
                if let (Some(cache), Some(key)) = (&ctx.cache, &task.cache_key) {
                    let ttl = spec.cache_policy.as_ref().and_then(|p| p.ttl);
                    let _ = cache.put(key, writes.clone(), ttl).await;
                }
                return TaskResult {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    writes,
                    status: TaskStatus::Success,
                    interrupts: Vec::new(),
                    parent_command: None,
                };
            }
            Err(NodeError::Interrupt(interrupt)) => {
                let writes = interrupt
                    .interrupts
                    .iter()
                    .map(|iv| (types::INTERRUPT.to_string(), json!(iv)))
                    .collect();
                return TaskResult {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    writes,
                    status: TaskStatus::Paused,
                    interrupts: interrupt.interrupts,
                    parent_command: None,
                };
            }
            Err(NodeError::ParentCommand(command)) => {
                return TaskResult {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    writes: Vec::new(),
                    status: TaskStatus::Success,
                    interrupts: Vec::new(),
                    parent_command: Some(*command),
                };
            }
            Err(error) => {
                let retriable = policy
                    .as_ref()
                    .is_some_and(|p| attempt < p.max_attempts && (p.retry_on)(&error));
                if retriable {
                    let delay = policy
                        .as_ref()
                        .map(|p| p.delay_for(attempt))
                        .unwrap_or_default();
                    tracing::debug!(
                        target: "stepweave::executor",
                        task = %task.id,
                        node = %task.name,
                        attempt,
                        error = %error,
                        "task attempt failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => {
                            return TaskResult {
                                task_id: task.id.clone(),
                                name: task.name.clone(),
                                writes: Vec::new(),
                                status: TaskStatus::Cancelled,
                                interrupts: Vec::new(),
                                parent_command: None,
                            };
                        }
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
                let message = error.to_string();
                return TaskResult {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    writes: vec![(
                        types::ERROR.to_string(),
                        json!({"name": task.name, "message": message}),
                    )],
                    status: TaskStatus::Failed { message },
                    interrupts: Vec::new(),
                    parent_command: None,
                };
            }
        }
    }
}

/// Internal knob for tests: a retry policy that never sleeps.
#[doc(hidden)]
#[must_use]
pub fn immediate_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_interval: Duration::ZERO,
        jitter: false,
        ..RetryPolicy::default()
    }
}
