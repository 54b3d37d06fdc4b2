//! Task planning for one superstep.
//!
//! From a checkpoint, the materialized channels, and the pending writes
//! attached to that checkpoint, derive the tasks to run: dynamic PUSH tasks
//! from `pending_sends`, then subscription tasks for every node with a
//! freshly versioned trigger. Tasks already completed by a prior (crashed)
//! attempt are not re-run; their persisted writes are replayed instead.
//!
//! Planning is pure and deterministic: same checkpoint, same pending writes,
//! same plan. That determinism is what makes crash replay and resume
//! idempotent, because task ids are content-addressed.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::channels::BoxedChannel;
use crate::checkpoint::{Checkpoint, PendingWrite};
use crate::graph::{GraphSpec, NodeSpec};
use crate::types::{self, TASKS, TASK_SEP, Version};

use super::SchedulerError;

/// A unit of work scheduled for one node in one superstep.
#[derive(Clone, Debug)]
pub struct Task {
    /// Deterministic id: UUIDv5 over `(checkpoint id, node, sorted triggers,
    /// discriminator)`. Planning always runs against the last committed
    /// checkpoint, so replaying that checkpoint re-derives identical ids and
    /// idempotent commits detect duplicates.
    pub id: String,
    pub name: String,
    /// Input projection (bare value for single-channel subscriptions, object
    /// otherwise; the raw payload for PUSH tasks).
    pub input: Value,
    /// Channel names that fired this task, sorted.
    pub triggers: Vec<String>,
    /// Resume values recorded for this task's interrupts, in ordinal order.
    pub resume_values: Vec<Value>,
    /// Memoization key when the node declares a cache policy.
    pub cache_key: Option<String>,
    /// Writes persisted by a prior completed attempt; when present the
    /// runner replays them instead of executing the node.
    pub cached_writes: Option<Vec<PendingWrite>>,
}

/// Output of [`plan_step`].
#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<Task>,
    /// `versions_seen` entries for the planned nodes. The loop folds these
    /// into its live checkpoint only *after* committing, so a crash replays
    /// the same plan.
    pub seen_updates: FxHashMap<String, FxHashMap<String, Version>>,
}

fn task_uuid(checkpoint_id: &str, name: &str, triggers: &[String], discriminator: usize) -> String {
    let seed = format!(
        "{checkpoint_id}{TASK_SEP}{name}{TASK_SEP}{}{TASK_SEP}{discriminator}",
        triggers.join(",")
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

/// Stable memoization key: the node's custom derivation, or a UUIDv5 over the
/// canonical JSON of the input.
fn cache_key_for(spec: &NodeSpec, input: &Value) -> Option<String> {
    let policy = spec.cache_policy.as_ref()?;
    if let Some(key_fn) = &policy.key_fn {
        return Some(format!("{}{TASK_SEP}{}", spec.name, key_fn(input)));
    }
    let canonical = input.to_string();
    Some(format!(
        "{}{TASK_SEP}{}",
        spec.name,
        Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes())
    ))
}

/// Project a node's subscribed channels into its input value.
///
/// Returns `None` (skip the node this step) when any subscribed channel is
/// empty.
fn project_input(
    spec: &NodeSpec,
    channels: &FxHashMap<String, BoxedChannel>,
) -> Result<Option<Value>, SchedulerError> {
    if spec.channels.is_empty() {
        return Ok(Some(Value::Null));
    }
    let mut object = Map::new();
    for name in &spec.channels {
        let Some(channel) = channels.get(name) else {
            return Ok(None);
        };
        match channel.get() {
            Ok(value) => {
                object.insert(name.clone(), value);
            }
            Err(err) if err.is_empty() => return Ok(None),
            Err(err) => return Err(err.into()),
        }
    }
    if spec.channels.len() == 1 {
        return Ok(object.remove(&spec.channels[0]));
    }
    Ok(Some(Value::Object(object)))
}

#[derive(Default)]
struct WriteIndex<'a> {
    has_error: bool,
    has_interrupt: bool,
    has_scheduled: bool,
    has_no_writes_marker: bool,
    resume_values: Vec<Value>,
    data_writes: Vec<&'a PendingWrite>,
}

fn index_writes(pending_writes: &[PendingWrite]) -> FxHashMap<&str, WriteIndex<'_>> {
    let mut by_task: FxHashMap<&str, WriteIndex<'_>> = FxHashMap::default();
    for write in pending_writes {
        let entry = by_task.entry(write.task_id.as_str()).or_default();
        match write.channel.as_str() {
            types::ERROR => entry.has_error = true,
            types::INTERRUPT => entry.has_interrupt = true,
            types::SCHEDULED => entry.has_scheduled = true,
            types::NO_WRITES => entry.has_no_writes_marker = true,
            types::RESUME => entry.resume_values.push(write.value.clone()),
            _ => entry.data_writes.push(write),
        }
    }
    by_task
}

/// Derive the tasks for one superstep. See the module docs for the
/// algorithm; ordering is deterministic (PUSH tasks in send order, then
/// subscription tasks by node name).
pub fn plan_step(
    graph: &GraphSpec,
    channels: &FxHashMap<String, BoxedChannel>,
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    _step: i64,
) -> Result<Plan, SchedulerError> {
    let writes_by_task = index_writes(pending_writes);
    let mut plan = Plan::default();

    // 1. Dynamic tasks from pending sends.
    for (discriminator, send) in checkpoint.pending_sends.iter().enumerate() {
        if graph.node(&send.node).is_none() {
            return Err(SchedulerError::UnknownSendTarget {
                name: send.node.clone(),
            });
        }
        let triggers = vec![TASKS.to_string()];
        plan.tasks.push(Task {
            id: task_uuid(&checkpoint.id, &send.node, &triggers, discriminator),
            name: send.node.clone(),
            input: send.input.clone(),
            triggers,
            resume_values: Vec::new(),
            cache_key: None,
            cached_writes: None,
        });
    }

    // 2. Subscription tasks, in deterministic node order.
    for name in graph.node_order() {
        let Some(spec) = graph.node(name) else {
            continue;
        };
        let mut fired: Vec<String> = spec
            .triggers
            .iter()
            .filter(|trigger| {
                let current = checkpoint.channel_versions.get(*trigger).copied().unwrap_or(0);
                let seen = checkpoint
                    .versions_seen
                    .get(name)
                    .and_then(|seen| seen.get(*trigger))
                    .copied()
                    .unwrap_or(0);
                current > seen
            })
            .cloned()
            .collect();
        if fired.is_empty() {
            continue;
        }
        fired.sort();

        let Some(input) = project_input(spec, channels)? else {
            continue;
        };

        let seen = plan.seen_updates.entry(name.clone()).or_default();
        for trigger in &fired {
            if let Some(version) = checkpoint.channel_versions.get(trigger) {
                seen.insert(trigger.clone(), *version);
            }
        }

        plan.tasks.push(Task {
            id: task_uuid(&checkpoint.id, name, &fired, 0),
            name: name.clone(),
            input: input.clone(),
            triggers: fired,
            resume_values: Vec::new(),
            cache_key: cache_key_for(spec, &input),
            cached_writes: None,
        });
    }

    // 3. Deferred nodes wait until only deferred work remains.
    let any_eager = plan
        .tasks
        .iter()
        .any(|task| !graph.node(&task.name).is_some_and(|spec| spec.defer));
    if any_eager {
        let deferred: Vec<&str> = plan
            .tasks
            .iter()
            .filter(|task| graph.node(&task.name).is_some_and(|spec| spec.defer))
            .map(|task| task.name.as_str())
            .collect();
        if !deferred.is_empty() {
            tracing::debug!(target: "stepweave::planner", ?deferred, "holding deferred tasks");
        }
        plan.tasks
            .retain(|task| !graph.node(&task.name).is_some_and(|spec| spec.defer));
        plan.seen_updates
            .retain(|name, _| !graph.node(name).is_some_and(|spec| spec.defer));
    }

    // 4. Fold in prior attempts: drop surfaced errors, replay completed
    // writes, attach resume values to interrupted tasks.
    let mut tasks = Vec::with_capacity(plan.tasks.len());
    for mut task in plan.tasks.drain(..) {
        match writes_by_task.get(task.id.as_str()) {
            None => tasks.push(task),
            Some(index) => {
                if index.has_error {
                    continue;
                }
                if index.has_scheduled {
                    task.cached_writes = Some(Vec::new());
                } else if !index.has_interrupt
                    && (index.has_no_writes_marker || !index.data_writes.is_empty())
                {
                    task.cached_writes =
                        Some(index.data_writes.iter().map(|w| (*w).clone()).collect());
                }
                task.resume_values = index.resume_values.clone();
                tasks.push(task);
            }
        }
    }
    plan.tasks = tasks;

    Ok(plan)
}
