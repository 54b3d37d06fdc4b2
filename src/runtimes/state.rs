//! State inspection and structured state updates.
//!
//! Everything here works from checkpoints alone: a snapshot loads the tuple,
//! materializes channels, and re-plans without executing; an update
//! synthesizes a virtual task attributed to a node, pushes its writes through
//! the channel reducers, bumps versions, and commits a new checkpoint with
//! `source: "update"`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::channels::{BoxedChannel, ChannelError};
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointTuple,
    Checkpointer, CheckpointerError, ListOptions,
};
use crate::graph::GraphSpec;
use crate::schedulers::{self, SchedulerError};
use crate::types::{self, START, Version};

/// Errors from the state API.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    /// The update is ambiguous or malformed.
    #[error("invalid state update: {0}")]
    #[diagnostic(code(stepweave::state::invalid_update))]
    InvalidUpdate(String),

    /// The update names a node the graph does not declare.
    #[error("unknown node `{name}`")]
    #[diagnostic(code(stepweave::state::unknown_node))]
    UnknownNode { name: String },

    /// A stateful operation was attempted without a checkpointer bound.
    #[error("this operation requires a checkpointer")]
    #[diagnostic(code(stepweave::state::missing_checkpointer))]
    MissingCheckpointer,

    #[error(transparent)]
    #[diagnostic(code(stepweave::state::channel))]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    #[diagnostic(code(stepweave::state::scheduler))]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(code(stepweave::state::checkpointer))]
    Checkpointer(#[from] CheckpointerError),
}

/// Planned-but-unexecuted task surfaced by a snapshot.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    /// Outstanding interrupt payloads recorded for this task.
    pub interrupts: Vec<Value>,
    /// `{name, message}` when a prior attempt of this task failed.
    pub error: Option<Value>,
}

/// Point-in-time view of one thread.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    /// Output-channel projection of the checkpointed values.
    pub values: Value,
    /// Names of the nodes that would run next.
    pub next: Vec<String>,
    pub tasks: Vec<TaskInfo>,
    pub metadata: Option<CheckpointMetadata>,
    pub created_at: Option<DateTime<Utc>>,
    pub config: CheckpointConfig,
    pub parent_config: Option<CheckpointConfig>,
}

impl StateSnapshot {
    /// Snapshot of a thread that has never committed.
    #[must_use]
    pub fn empty(config: CheckpointConfig) -> Self {
        Self {
            values: Value::Object(Map::new()),
            next: Vec::new(),
            tasks: Vec::new(),
            metadata: None,
            created_at: None,
            config,
            parent_config: None,
        }
    }
}

/// One entry in a bulk update superstep.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    /// JSON object of channel writes; `None` applies no writes (useful with
    /// the `__end__` sentinel).
    pub values: Option<Value>,
    /// Node to attribute the writes to, or one of the sentinels
    /// `__input__`, `__end__`, `__copy__`.
    pub as_node: Option<String>,
}

impl StateUpdate {
    #[must_use]
    pub fn new(values: Value, as_node: Option<String>) -> Self {
        Self {
            values: Some(values),
            as_node,
        }
    }
}

fn project_values(graph: &GraphSpec, channels: &FxHashMap<String, BoxedChannel>) -> Value {
    let names: Vec<String> = if graph.output_channels().is_empty() {
        let mut names: Vec<String> = graph
            .channel_prototypes()
            .keys()
            .filter(|name| types::is_valid_name(name))
            .cloned()
            .collect();
        names.sort();
        names
    } else {
        graph.output_channels().to_vec()
    };
    let mut out = Map::new();
    for name in names {
        if let Some(channel) = channels.get(&name) {
            if let Ok(value) = channel.get() {
                out.insert(name, value);
            }
        }
    }
    Value::Object(out)
}

fn snapshot_from_tuple(
    graph: &GraphSpec,
    tuple: CheckpointTuple,
) -> Result<StateSnapshot, StateError> {
    let channels = graph.materialize(&tuple.checkpoint.channel_values)?;
    let plan = schedulers::plan_step(
        graph,
        &channels,
        &tuple.checkpoint,
        &tuple.pending_writes,
        tuple.metadata.step + 1,
    )?;

    let mut next = Vec::new();
    let mut tasks = Vec::new();
    for task in &plan.tasks {
        let interrupts: Vec<Value> = tuple
            .pending_writes
            .iter()
            .filter(|w| w.task_id == task.id && w.channel == types::INTERRUPT)
            .map(|w| w.value.clone())
            .collect();
        next.push(task.name.clone());
        tasks.push(TaskInfo {
            id: task.id.clone(),
            name: task.name.clone(),
            interrupts,
            error: None,
        });
    }
    // Tasks dropped from the plan because their error already surfaced are
    // still worth showing.
    for write in &tuple.pending_writes {
        if write.channel == types::ERROR && !tasks.iter().any(|t| t.id == write.task_id) {
            let name = write
                .value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            tasks.push(TaskInfo {
                id: write.task_id.clone(),
                name,
                interrupts: Vec::new(),
                error: Some(write.value.clone()),
            });
        }
    }

    Ok(StateSnapshot {
        values: project_values(graph, &channels),
        next,
        tasks,
        created_at: Some(tuple.checkpoint.ts),
        metadata: Some(tuple.metadata),
        config: tuple.config,
        parent_config: tuple.parent_config,
    })
}

/// Latest (or addressed) state of a thread, without executing anything.
pub async fn get_state(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
) -> Result<StateSnapshot, StateError> {
    match checkpointer.get_tuple(config).await? {
        Some(tuple) => snapshot_from_tuple(graph.as_ref(), tuple),
        None => Ok(StateSnapshot::empty(config.clone())),
    }
}

/// Lazy reverse-chronological state history.
pub async fn get_state_history(
    graph: Arc<GraphSpec>,
    checkpointer: Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    options: ListOptions,
) -> Result<BoxStream<'static, Result<StateSnapshot, StateError>>, StateError> {
    let tuples = checkpointer.list(config, options).await?;
    Ok(tuples
        .map(move |tuple| {
            tuple
                .map_err(StateError::from)
                .and_then(|tuple| snapshot_from_tuple(graph.as_ref(), tuple))
        })
        .boxed())
}

struct LoadedThread {
    checkpoint: Checkpoint,
    channels: FxHashMap<String, BoxedChannel>,
    config: CheckpointConfig,
    step: i64,
    new_versions: FxHashMap<String, Version>,
}

async fn load_thread(
    graph: &GraphSpec,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
) -> Result<LoadedThread, StateError> {
    let tuple = checkpointer.get_tuple(config).await?;
    let (checkpoint, base_config, step) = match tuple {
        Some(tuple) => (
            tuple.checkpoint,
            tuple.config,
            tuple.metadata.step + 1,
        ),
        None => (Checkpoint::empty(), config.clone(), -1),
    };
    let channels = graph.materialize(&checkpoint.channel_values)?;
    Ok(LoadedThread {
        checkpoint,
        channels,
        config: base_config,
        step,
        new_versions: FxHashMap::default(),
    })
}

fn bump_version(
    checkpointer: &Arc<dyn Checkpointer>,
    thread: &mut LoadedThread,
    name: &str,
) {
    let prev = thread.checkpoint.channel_versions.get(name).copied();
    let next = checkpointer.next_version(prev);
    thread
        .checkpoint
        .channel_versions
        .insert(name.to_string(), next);
    thread.new_versions.insert(name.to_string(), next);
}

fn rebuild_values(thread: &mut LoadedThread) {
    for (name, channel) in &thread.channels {
        match channel.checkpoint() {
            Some(snapshot) => {
                thread
                    .checkpoint
                    .channel_values
                    .insert(name.clone(), snapshot);
            }
            None => {
                thread.checkpoint.channel_values.remove(name);
            }
        }
    }
}

fn apply_values(
    checkpointer: &Arc<dyn Checkpointer>,
    thread: &mut LoadedThread,
    values: &Value,
) -> Result<(), StateError> {
    let Value::Object(entries) = values else {
        return Err(StateError::InvalidUpdate(
            "update values must be a JSON object of channel writes".to_string(),
        ));
    };
    for (channel_name, value) in entries {
        let Some(channel) = thread.channels.get_mut(channel_name) else {
            return Err(StateError::InvalidUpdate(format!(
                "`{channel_name}` is not a declared channel"
            )));
        };
        if channel.update(vec![value.clone()])? {
            bump_version(checkpointer, thread, channel_name);
        }
    }
    Ok(())
}

async fn commit_thread(
    checkpointer: &Arc<dyn Checkpointer>,
    thread: &mut LoadedThread,
    source: CheckpointSource,
    parents: FxHashMap<String, String>,
) -> Result<CheckpointConfig, StateError> {
    rebuild_values(thread);
    let next = thread.checkpoint.advance();
    let mut metadata = CheckpointMetadata::new(source, thread.step);
    metadata.parents = parents;
    let committed = checkpointer
        .put(
            &thread.config,
            next.clone(),
            metadata,
            std::mem::take(&mut thread.new_versions),
        )
        .await?;
    thread.checkpoint = next;
    thread.config = committed.clone();
    Ok(committed)
}

fn resolve_as_node<'a>(
    graph: &'a GraphSpec,
    as_node: Option<&'a str>,
) -> Result<&'a str, StateError> {
    match as_node {
        Some(name) => {
            if graph.node(name).is_none() {
                return Err(StateError::UnknownNode {
                    name: name.to_string(),
                });
            }
            Ok(name)
        }
        None => match graph.node_order() {
            [only] => Ok(only.as_str()),
            [] => Err(StateError::InvalidUpdate(
                "graph has no nodes to attribute the update to".to_string(),
            )),
            _ => Err(StateError::InvalidUpdate(
                "as_node not provided and multiple candidate nodes exist".to_string(),
            )),
        },
    }
}

/// Apply one update attributed to `as_node` and commit a checkpoint with
/// `source: "update"`. Returns the new checkpoint's config.
pub async fn update_state(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    values: Value,
    as_node: Option<String>,
) -> Result<CheckpointConfig, StateError> {
    bulk_update_state(
        graph,
        checkpointer,
        config,
        vec![vec![StateUpdate::new(values, as_node)]],
    )
    .await
}

/// Apply a sequence of update supersteps; each inner batch commits one
/// checkpoint. Sentinel `as_node` values (`__input__`, `__end__`,
/// `__copy__`) must be the sole update of their batch.
pub async fn bulk_update_state(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    supersteps: Vec<Vec<StateUpdate>>,
) -> Result<CheckpointConfig, StateError> {
    if supersteps.is_empty() || supersteps.iter().any(Vec::is_empty) {
        return Err(StateError::InvalidUpdate(
            "bulk update requires at least one non-empty superstep".to_string(),
        ));
    }
    let mut cursor = config.clone();
    for batch in supersteps {
        let is_sentinel = batch
            .iter()
            .any(|u| u.as_node.as_deref().is_some_and(types::is_reserved));
        if is_sentinel && batch.len() > 1 {
            return Err(StateError::InvalidUpdate(
                "sentinel updates must be the sole update of their superstep".to_string(),
            ));
        }
        cursor = apply_batch(graph, checkpointer, &cursor, batch).await?;
    }
    Ok(cursor)
}

async fn apply_batch(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    batch: Vec<StateUpdate>,
) -> Result<CheckpointConfig, StateError> {
    if let [update] = batch.as_slice() {
        match update.as_node.as_deref() {
            Some(types::INPUT) => return apply_as_input(graph, checkpointer, config, update).await,
            Some(types::END) => return apply_as_end(graph, checkpointer, config, update).await,
            Some(types::COPY) => return apply_as_copy(graph, checkpointer, config, update).await,
            Some(name) if types::is_reserved(name) => {
                return Err(StateError::InvalidUpdate(format!(
                    "`{name}` is not a valid update sentinel"
                )));
            }
            _ => {}
        }
    }

    let mut thread = load_thread(graph.as_ref(), checkpointer, config).await?;
    for update in &batch {
        let as_node = resolve_as_node(graph.as_ref(), update.as_node.as_deref())?.to_string();
        // The virtual task observed its triggers as they were before its own
        // writes; record that so the node does not re-trigger on itself.
        let seen: FxHashMap<String, Version> = graph
            .node(&as_node)
            .map(|spec| {
                spec.triggers
                    .iter()
                    .filter_map(|t| {
                        thread
                            .checkpoint
                            .channel_versions
                            .get(t)
                            .map(|v| (t.clone(), *v))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(values) = &update.values {
            apply_values(checkpointer, &mut thread, values)?;
        }
        thread
            .checkpoint
            .versions_seen
            .insert(as_node, seen);
    }
    commit_thread(
        checkpointer,
        &mut thread,
        CheckpointSource::Update,
        FxHashMap::default(),
    )
    .await
}

async fn apply_as_input(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    update: &StateUpdate,
) -> Result<CheckpointConfig, StateError> {
    let Some(values) = &update.values else {
        return Err(StateError::InvalidUpdate(
            "__input__ update requires values".to_string(),
        ));
    };
    let mut thread = load_thread(graph.as_ref(), checkpointer, config).await?;
    apply_values(checkpointer, &mut thread, values)?;
    if let Some(channel) = thread.channels.get_mut(START) {
        channel.update(vec![values.clone()])?;
        bump_version(checkpointer, &mut thread, START);
    }
    commit_thread(
        checkpointer,
        &mut thread,
        CheckpointSource::Input,
        FxHashMap::default(),
    )
    .await
}

async fn apply_as_end(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    update: &StateUpdate,
) -> Result<CheckpointConfig, StateError> {
    let mut thread = load_thread(graph.as_ref(), checkpointer, config).await?;
    if let Some(values) = &update.values {
        apply_values(checkpointer, &mut thread, values)?;
    }
    // Mark every node as having seen every channel: nothing triggers, so the
    // applied writes have no continuation.
    let versions = thread.checkpoint.channel_versions.clone();
    for name in graph.node_order() {
        thread
            .checkpoint
            .versions_seen
            .insert(name.clone(), versions.clone());
    }
    commit_thread(
        checkpointer,
        &mut thread,
        CheckpointSource::Update,
        FxHashMap::default(),
    )
    .await
}

async fn apply_as_copy(
    graph: &Arc<GraphSpec>,
    checkpointer: &Arc<dyn Checkpointer>,
    config: &CheckpointConfig,
    update: &StateUpdate,
) -> Result<CheckpointConfig, StateError> {
    let Some(tuple) = checkpointer.get_tuple(config).await? else {
        return Err(StateError::InvalidUpdate(
            "__copy__ requires an existing checkpoint to fork".to_string(),
        ));
    };
    let mut thread = LoadedThread {
        channels: graph.materialize(&tuple.checkpoint.channel_values)?,
        checkpoint: tuple.checkpoint.clone(),
        config: tuple.config.clone(),
        step: tuple.metadata.step + 1,
        new_versions: FxHashMap::default(),
    };
    if let Some(values) = &update.values {
        apply_values(checkpointer, &mut thread, values)?;
    }
    let mut parents = FxHashMap::default();
    parents.insert(
        tuple.config.checkpoint_ns.clone(),
        tuple.checkpoint.id.clone(),
    );
    commit_thread(checkpointer, &mut thread, CheckpointSource::Fork, parents).await
}
