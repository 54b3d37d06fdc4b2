//! The superstep loop.
//!
//! [`GraphRunner`] drives one invocation: seed input, then tick until no
//! tasks remain, an interrupt fires, the recursion limit trips, or the caller
//! cancels. Each tick plans tasks against the last committed checkpoint, runs
//! them through the scheduler, applies their writes through the channel
//! reducers, and commits a new checkpoint. The loop is single-threaded and is
//! the sole mutator of channels, checkpoints, and pending writes; tasks only
//! ever touch their own buffers.
//!
//! Crash safety falls out of two rules: task ids are derived from the
//! committed checkpoint they run against, and writes are persisted per task
//! before the next checkpoint commits. Re-planning the same checkpoint
//! re-derives the same ids, so completed work is replayed from its persisted
//! writes instead of re-executed.

use std::collections::BTreeMap;
use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::channels::{BoxedChannel, ChannelError};
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, Checkpointer,
    CheckpointerError, PendingWrite,
};
use crate::command::{Command, GraphInput, InterruptValue, Send as SendPayload};
use crate::graph::GraphSpec;
use crate::schedulers::{self, SchedulerError, StepContext, TaskStatus};
use crate::store::{Cache, Store};
use crate::stream::{StreamBus, StreamMode};
use crate::types::{self, START, TASKS, Version};

use super::config::{Durability, RunConfig};

/// Fatal loop errors surfaced to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum LoopError {
    /// The invocation exceeded its superstep budget without settling.
    #[error("graph recursion limit of {limit} exceeded at step {step}")]
    #[diagnostic(
        code(stepweave::runtimes::recursion),
        help("Raise `recursion_limit` or break the trigger cycle keeping the graph busy.")
    )]
    RecursionLimit { limit: usize, step: i64 },

    /// A stateful operation was attempted without a checkpointer bound.
    #[error("this operation requires a checkpointer")]
    #[diagnostic(code(stepweave::runtimes::missing_checkpointer))]
    MissingCheckpointer,

    /// The invocation input was unusable.
    #[error("invalid graph input: {0}")]
    #[diagnostic(code(stepweave::runtimes::invalid_input))]
    InvalidInput(String),

    /// A task wrote to a channel the graph does not declare.
    #[error("task `{task}` wrote to unknown channel `{channel}`")]
    #[diagnostic(code(stepweave::runtimes::unknown_channel))]
    UnknownWriteChannel { task: String, channel: String },

    /// A task exhausted its retries; the error write is persisted and the
    /// run halts after the step's siblings complete.
    #[error("node `{name}` failed: {message}")]
    #[diagnostic(code(stepweave::runtimes::task_failed))]
    TaskFailed { name: String, message: String },

    /// A `ParentCommand` escaped the root graph.
    #[error("parent command escaped the root graph")]
    #[diagnostic(
        code(stepweave::runtimes::parent_command),
        help("ParentCommand is consumed by an enclosing graph; the root has none.")
    )]
    UnhandledParentCommand(Box<Command>),

    #[error(transparent)]
    #[diagnostic(code(stepweave::runtimes::channel))]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    #[diagnostic(code(stepweave::runtimes::scheduler))]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(code(stepweave::runtimes::checkpointer))]
    Checkpointer(#[from] CheckpointerError),

    /// A background commit task panicked.
    #[error("checkpoint commit task failed: {0}")]
    #[diagnostic(code(stepweave::runtimes::commit_join))]
    CommitJoin(String),
}

/// How an invocation ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunStatus {
    /// No tasks remained; the graph settled.
    Done,
    /// Halted on an interrupt gate or an in-task interrupt; re-invoke the
    /// thread to continue.
    Interrupted(Vec<InterruptValue>),
    /// Cancelled cooperatively via the run's cancellation token.
    Cancelled,
}

/// Final result of one invocation.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Output-channel projection at the end of the run.
    pub values: Value,
    /// Config of the last committed checkpoint, when one exists.
    pub config: Option<CheckpointConfig>,
}

struct LiveState {
    channels: FxHashMap<String, BoxedChannel>,
    checkpoint: Checkpoint,
    /// Addresses the checkpoint the next `put` forks from; carries the id of
    /// the last commit (pending writes attach here).
    checkpoint_config: CheckpointConfig,
    pending_writes: Vec<PendingWrite>,
    /// Metadata step for the next commit.
    step: i64,
    /// Versions minted since the last commit.
    new_versions: FxHashMap<String, Version>,
    commits: Vec<JoinHandle<std::result::Result<CheckpointConfig, CheckpointerError>>>,
    /// Whether this invocation has already seeded input or executed a step;
    /// gates `interrupt_before` so a resumed run passes the gate once.
    made_progress: bool,
    has_committed: bool,
}

/// Drives the superstep loop for one invocation.
pub struct GraphRunner {
    graph: Arc<GraphSpec>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    store: Option<Arc<dyn Store>>,
    cache: Option<Arc<dyn Cache>>,
    bus: StreamBus,
    config: RunConfig,
    namespace: String,
}

impl GraphRunner {
    pub(crate) fn new(
        graph: Arc<GraphSpec>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        store: Option<Arc<dyn Store>>,
        cache: Option<Arc<dyn Cache>>,
        bus: StreamBus,
        config: RunConfig,
        namespace: String,
    ) -> Self {
        Self {
            graph,
            checkpointer,
            store,
            cache,
            bus,
            config,
            namespace,
        }
    }

    /// Run to a stop condition; closes the bus on the way out. Errors become
    /// a terminal `error` event before the close so stream consumers never
    /// hang.
    pub async fn run(&self, input: GraphInput) -> Result<RunOutcome, LoopError> {
        let result = self.run_inner(input).await;
        if let Err(err) = &result {
            self.bus.push_error(self.namespace.clone(), err.to_string()).await;
        }
        self.bus.close();
        result
    }

    #[instrument(skip(self, input), fields(thread = %self.config.configurable.thread_id))]
    async fn run_inner(&self, input: GraphInput) -> Result<RunOutcome, LoopError> {
        let mut live = self.prepare(input).await?;
        self.emit_values(&live).await;

        let status = match self.drive(&mut live).await {
            Ok(status) => status,
            Err(err) => {
                // Outstanding async commits are awaited even on failure so
                // the caller never races its own checkpointer.
                let _ = self.await_commits(&mut live).await;
                return Err(err);
            }
        };

        self.finish(&mut live, &status).await?;
        Ok(RunOutcome {
            values: self.output_values(&live),
            config: live.has_committed.then(|| live.checkpoint_config.clone()),
            status,
        })
    }

    async fn drive(&self, live: &mut LiveState) -> Result<RunStatus, LoopError> {
        let cancel = self.config.cancel.clone();
        let mut executed = 0usize;
        let status = loop {
            if cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let plan = schedulers::plan_step(
                self.graph.as_ref(),
                &live.channels,
                &live.checkpoint,
                &live.pending_writes,
                live.step,
            )?;
            self.emit_debug_plan(live, &plan).await;

            if plan.tasks.is_empty() {
                break RunStatus::Done;
            }
            if executed >= self.config.recursion_limit.max(1) {
                return Err(LoopError::RecursionLimit {
                    limit: self.config.recursion_limit.max(1),
                    step: live.step,
                });
            }
            if live.made_progress
                && plan
                    .tasks
                    .iter()
                    .any(|task| self.config.interrupt_before.contains(&task.name))
            {
                break RunStatus::Interrupted(Vec::new());
            }

            // Fold observed trigger versions into the live checkpoint; they
            // persist with the *next* commit so replays of the current one
            // re-derive this same plan.
            for (node, seen) in &plan.seen_updates {
                live.checkpoint
                    .versions_seen
                    .entry(node.clone())
                    .or_default()
                    .extend(seen.iter().map(|(k, v)| (k.clone(), *v)));
            }
            let trigger_channels: FxHashSet<String> = plan
                .tasks
                .iter()
                .flat_map(|task| task.triggers.iter().cloned())
                .collect();

            let ctx = StepContext {
                step: live.step,
                namespace: self.namespace.clone(),
                checkpoint_config: live.checkpoint_config.clone(),
                checkpointer: self.checkpointer.clone(),
                cache: self.cache.clone(),
                store: self.store.clone(),
                bus: self.bus.clone(),
                cancel: cancel.clone(),
                max_concurrency: self.config.max_concurrency,
                step_timeout: self.config.step_timeout,
            };
            let outcome = schedulers::run_step(&self.graph, plan.tasks, &ctx).await?;

            if let Some(command) = outcome.parent_command {
                return Err(LoopError::UnhandledParentCommand(Box::new(command)));
            }
            if outcome.cancelled || cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }
            if !outcome.interrupts.is_empty() {
                // Writes (including the interrupt records) stay pending
                // against the current checkpoint; the next invocation
                // replans it and resumes.
                break RunStatus::Interrupted(outcome.interrupts);
            }
            if let Some(failed) = outcome
                .results
                .iter()
                .find(|r| matches!(r.status, TaskStatus::Failed { .. }))
            {
                let message = match &failed.status {
                    TaskStatus::Failed { message } => message.clone(),
                    _ => String::new(),
                };
                return Err(LoopError::TaskFailed {
                    name: failed.name.clone(),
                    message,
                });
            }

            let ran_after_gate = outcome.results.iter().any(|r| {
                matches!(r.status, TaskStatus::Success | TaskStatus::Cached)
                    && self.config.interrupt_after.contains(&r.name)
            });

            // Step complete: every write becomes visible at once. Writes
            // attributed to the virtual input task (resume-time updates and
            // sends) ride along with this step's task writes.
            let mut step_writes: Vec<PendingWrite> = live
                .pending_writes
                .drain(..)
                .filter(|w| {
                    w.task_id == types::INPUT
                        && (w.channel == TASKS || !types::is_sentinel_channel(&w.channel))
                })
                .collect();
            for result in outcome
                .results
                .iter()
                .filter(|r| r.status != TaskStatus::Cancelled)
            {
                for (channel, value) in &result.writes {
                    step_writes.push(PendingWrite::new(
                        result.task_id.clone(),
                        channel.clone(),
                        value.clone(),
                    ));
                }
            }
            live.pending_writes = step_writes;
            self.apply_writes(live)?;
            for name in &trigger_channels {
                if let Some(channel) = live.channels.get_mut(name) {
                    channel.consume();
                }
            }
            self.rebuild_channel_values(live);
            self.emit_values(live).await;
            self.commit(live, CheckpointSource::Loop, false).await?;
            live.step += 1;
            executed += 1;
            live.made_progress = true;

            if ran_after_gate {
                break RunStatus::Interrupted(Vec::new());
            }
        };
        Ok(status)
    }

    async fn prepare(&self, input: GraphInput) -> Result<LiveState, LoopError> {
        let tuple = match &self.checkpointer {
            Some(checkpointer) => checkpointer.get_tuple(&self.config.configurable).await?,
            None => None,
        };
        let (checkpoint, prev_step, pending_writes, base_config) = match &tuple {
            Some(tuple) => (
                tuple.checkpoint.clone(),
                tuple.metadata.step,
                tuple.pending_writes.clone(),
                tuple.config.clone(),
            ),
            None => (
                Checkpoint::empty(),
                -2,
                Vec::new(),
                self.config.configurable.clone(),
            ),
        };
        let channels = self.graph.materialize(&checkpoint.channel_values)?;
        let mut live = LiveState {
            channels,
            checkpoint,
            checkpoint_config: base_config,
            pending_writes,
            step: prev_step + 1,
            new_versions: FxHashMap::default(),
            commits: Vec::new(),
            made_progress: false,
            has_committed: tuple.is_some(),
        };

        match input {
            GraphInput::Values(value) => {
                self.seed_input(&mut live, value).await?;
                live.made_progress = true;
            }
            GraphInput::Command(command) => {
                if !live.has_committed {
                    return Err(LoopError::InvalidInput(
                        "a command requires an existing thread checkpoint".to_string(),
                    ));
                }
                self.apply_command(&mut live, command).await?;
                live.made_progress = true;
            }
            GraphInput::Empty => {
                if !live.has_committed {
                    return Err(LoopError::InvalidInput(
                        "empty input requires an existing thread checkpoint".to_string(),
                    ));
                }
            }
        }
        Ok(live)
    }

    async fn seed_input(&self, live: &mut LiveState, value: Value) -> Result<(), LoopError> {
        let Value::Object(entries) = value else {
            return Err(LoopError::InvalidInput(
                "graph input must be a JSON object of channel values".to_string(),
            ));
        };
        let allowed: Vec<String> = self
            .config
            .input_keys
            .clone()
            .unwrap_or_else(|| self.graph.input_channels().to_vec());
        for (key, val) in &entries {
            if !allowed.is_empty() && !allowed.contains(key) {
                return Err(LoopError::InvalidInput(format!(
                    "`{key}` is not a registered input channel"
                )));
            }
            let Some(channel) = live.channels.get_mut(key) else {
                return Err(LoopError::InvalidInput(format!(
                    "`{key}` is not a declared channel"
                )));
            };
            if channel.update(vec![val.clone()])? {
                self.bump_version(live, key);
            }
        }
        // Entry signal: the raw payload lands on the reserved start channel
        // so entry nodes trigger.
        if let Some(channel) = live.channels.get_mut(START) {
            channel.update(vec![Value::Object(entries)])?;
            self.bump_version(live, START);
        }
        self.rebuild_channel_values(live);
        // Fresh input supersedes any stale pending writes on this thread.
        live.pending_writes.clear();
        self.commit(live, CheckpointSource::Input, false).await?;
        live.step += 1;
        Ok(())
    }

    async fn apply_command(&self, live: &mut LiveState, command: Command) -> Result<(), LoopError> {
        let mut writes: Vec<PendingWrite> = Vec::new();

        if let Some(resume) = command.resume {
            let mut interrupted: Vec<String> = live
                .pending_writes
                .iter()
                .filter(|w| w.channel == types::INTERRUPT)
                .map(|w| w.task_id.clone())
                .collect();
            interrupted.sort();
            interrupted.dedup();
            if interrupted.is_empty() {
                return Err(LoopError::InvalidInput(
                    "resume command but no outstanding interrupt".to_string(),
                ));
            }
            // Deterministic ordinal: task-id order. An array resume with a
            // matching length zips; anything else resumes the first.
            let targets: Vec<(String, Value)> = match resume {
                Value::Array(items) if items.len() == interrupted.len() => {
                    interrupted.into_iter().zip(items).collect()
                }
                other => vec![(interrupted.remove(0), other)],
            };
            for (task_id, value) in targets {
                writes.push(PendingWrite::new(task_id, types::RESUME, value));
            }
        }
        for (channel, value) in command.update {
            writes.push(PendingWrite::new(types::INPUT, channel, value));
        }
        for send in command.goto {
            writes.push(PendingWrite::new(types::INPUT, TASKS, json!(send)));
        }

        if let Some(checkpointer) = &self.checkpointer {
            let mut by_task: BTreeMap<String, Vec<PendingWrite>> = BTreeMap::new();
            for write in &writes {
                by_task
                    .entry(write.task_id.clone())
                    .or_default()
                    .push(write.clone());
            }
            for (task_id, task_writes) in by_task {
                checkpointer
                    .put_writes(&live.checkpoint_config, task_writes, &task_id)
                    .await?;
            }
        }
        live.pending_writes.extend(writes);
        Ok(())
    }

    fn apply_writes(&self, live: &mut LiveState) -> Result<bool, LoopError> {
        // BTreeMap grouping keeps application order planner-deterministic.
        let mut by_channel: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut sends: Vec<SendPayload> = Vec::new();
        for write in &live.pending_writes {
            match write.channel.as_str() {
                TASKS => match serde_json::from_value::<SendPayload>(write.value.clone()) {
                    Ok(send) => sends.push(send),
                    Err(err) => {
                        return Err(LoopError::InvalidInput(format!(
                            "malformed send payload from task `{}`: {err}",
                            write.task_id
                        )));
                    }
                },
                channel if types::is_sentinel_channel(channel) => {}
                channel => {
                    if !live.channels.contains_key(channel) {
                        return Err(LoopError::UnknownWriteChannel {
                            task: write.task_id.clone(),
                            channel: channel.to_string(),
                        });
                    }
                    by_channel
                        .entry(channel.to_string())
                        .or_default()
                        .push(write.value.clone());
                }
            }
        }

        let mut changed = Vec::new();
        for (name, values) in by_channel {
            if let Some(channel) = live.channels.get_mut(&name) {
                if channel.update(values)? {
                    changed.push(name);
                }
            }
        }
        live.checkpoint.pending_sends = sends;
        for name in &changed {
            self.bump_version(live, name);
        }
        self.rebuild_channel_values(live);
        live.pending_writes.clear();
        Ok(!changed.is_empty())
    }

    fn bump_version(&self, live: &mut LiveState, name: &str) {
        let prev = live.checkpoint.channel_versions.get(name).copied();
        let next = match &self.checkpointer {
            Some(checkpointer) => checkpointer.next_version(prev),
            None => prev.unwrap_or(0) + 1,
        };
        live.checkpoint
            .channel_versions
            .insert(name.to_string(), next);
        live.new_versions.insert(name.to_string(), next);
    }

    fn rebuild_channel_values(&self, live: &mut LiveState) {
        for (name, channel) in &live.channels {
            match channel.checkpoint() {
                Some(snapshot) => {
                    live.checkpoint
                        .channel_values
                        .insert(name.clone(), snapshot);
                }
                None => {
                    live.checkpoint.channel_values.remove(name);
                }
            }
        }
    }

    /// Commit the live checkpoint under a fresh id.
    ///
    /// Under `Durability::Exit` loop commits are deferred until `force`;
    /// without a checkpointer the id still advances so task ids stay
    /// per-step unique.
    async fn commit(
        &self,
        live: &mut LiveState,
        source: CheckpointSource,
        force: bool,
    ) -> Result<(), LoopError> {
        let next = live.checkpoint.advance();
        let deferred = self.config.durability == Durability::Exit && !force;
        let Some(checkpointer) = &self.checkpointer else {
            live.checkpoint = next;
            live.new_versions.clear();
            return Ok(());
        };
        if deferred {
            live.checkpoint = next;
            return Ok(());
        }

        let parent = live.checkpoint_config.clone();
        let committed = parent.at(next.id.clone());
        let metadata = CheckpointMetadata::new(source, live.step);
        let new_versions = std::mem::take(&mut live.new_versions);

        match self.config.durability {
            Durability::Sync | Durability::Exit => {
                put_with_retry(checkpointer, &parent, next.clone(), metadata, new_versions).await?;
            }
            Durability::Async => {
                let checkpointer = Arc::clone(checkpointer);
                let checkpoint = next.clone();
                live.commits.push(tokio::spawn(async move {
                    put_with_retry(&checkpointer, &parent, checkpoint, metadata, new_versions)
                        .await
                }));
            }
        }

        self.bus
            .emitter(self.namespace.clone())
            .emit(
                StreamMode::Checkpoints,
                json!({
                    "id": next.id,
                    "step": live.step,
                    "source": source,
                }),
            )
            .await;

        live.checkpoint = next;
        live.checkpoint_config = committed;
        live.has_committed = true;
        Ok(())
    }

    async fn finish(&self, live: &mut LiveState, status: &RunStatus) -> Result<(), LoopError> {
        if *status == RunStatus::Done {
            let mut finished = false;
            for channel in live.channels.values_mut() {
                finished |= channel.finish();
            }
            if finished {
                self.rebuild_channel_values(live);
            }
        }
        if self.config.durability == Durability::Exit && self.checkpointer.is_some() {
            self.commit(live, CheckpointSource::Loop, true).await?;
        }
        self.await_commits(live).await
    }

    async fn await_commits(&self, live: &mut LiveState) -> Result<(), LoopError> {
        for handle in live.commits.drain(..) {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(err) => return Err(LoopError::CommitJoin(err.to_string())),
            }
        }
        Ok(())
    }

    fn output_channel_names(&self) -> Vec<String> {
        if let Some(keys) = &self.config.output_keys {
            return keys.clone();
        }
        if !self.graph.output_channels().is_empty() {
            return self.graph.output_channels().to_vec();
        }
        let mut names: Vec<String> = self
            .graph
            .channel_prototypes()
            .keys()
            .filter(|name| types::is_valid_name(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn output_values(&self, live: &LiveState) -> Value {
        let mut out = Map::new();
        for name in self.output_channel_names() {
            if let Some(channel) = live.channels.get(&name) {
                if let Ok(value) = channel.get() {
                    out.insert(name, value);
                }
            }
        }
        Value::Object(out)
    }

    async fn emit_values(&self, live: &LiveState) {
        self.bus
            .emitter(self.namespace.clone())
            .emit(StreamMode::Values, self.output_values(live))
            .await;
    }

    async fn emit_debug_plan(&self, live: &LiveState, plan: &schedulers::Plan) {
        if plan.tasks.is_empty() {
            return;
        }
        let tasks: Vec<Value> = plan
            .tasks
            .iter()
            .map(|task| {
                json!({
                    "id": task.id,
                    "name": task.name,
                    "triggers": task.triggers,
                    "replayed": task.cached_writes.is_some(),
                })
            })
            .collect();
        self.bus
            .emitter(self.namespace.clone())
            .emit(
                StreamMode::Debug,
                json!({"step": live.step, "checkpoint": live.checkpoint.id, "tasks": tasks}),
            )
            .await;
    }
}

async fn put_with_retry(
    checkpointer: &Arc<dyn Checkpointer>,
    parent: &CheckpointConfig,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    new_versions: FxHashMap<String, Version>,
) -> std::result::Result<CheckpointConfig, CheckpointerError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match checkpointer
            .put(parent, checkpoint.clone(), metadata.clone(), new_versions.clone())
            .await
        {
            Ok(config) => return Ok(config),
            Err(err) if attempt < 3 => {
                tracing::warn!(
                    target: "stepweave::runtimes",
                    attempt,
                    error = %err,
                    "checkpoint commit failed; retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(err) => return Err(err),
        }
    }
}
