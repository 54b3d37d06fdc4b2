//! Core identifiers for the stepweave runtime.
//!
//! This module defines the reserved channel/node names, the namespace
//! separators, and the version scalar used by every other module. These are
//! the fixed points of the persisted format: changing any constant here
//! changes the wire layout of checkpoints.
//!
//! # Reserved names
//!
//! Names beginning and ending with double underscores are owned by the
//! engine. User node and channel names must not collide with them, and must
//! not contain the namespace separators `|` and `:`. The compiled graph
//! description rejects offenders at validation time.

/// Virtual entry channel. The loop writes the raw input payload here when an
/// invocation seeds new input, so entry nodes can subscribe to it as a
/// trigger.
pub const START: &str = "__start__";

/// Virtual terminal name, reserved so user graphs cannot claim it.
pub const END: &str = "__end__";

/// Virtual task name attributed to input seeding writes.
pub const INPUT: &str = "__input__";

/// Sentinel write channel carrying interrupt payloads for a paused task.
pub const INTERRUPT: &str = "__interrupt__";

/// Sentinel write channel carrying `{name, message}` for a failed task.
pub const ERROR: &str = "__error__";

/// Sentinel write channel carrying resume values for an interrupted task.
pub const RESUME: &str = "__resume__";

/// Sentinel write channel marking a task as handed off to an external queue.
pub const SCHEDULED: &str = "__scheduled__";

/// Sentinel write channel marking a task that completed without writes, so
/// replay can tell "ran, wrote nothing" apart from "never ran".
pub const NO_WRITES: &str = "__no_writes__";

/// Reserved channel holding dynamically dispatched tasks (`Send`s). Also the
/// trigger name recorded on tasks produced by draining pending sends.
pub const TASKS: &str = "__pregel_tasks";

/// Sentinel node name for the `update_state` fork operation.
pub const COPY: &str = "__copy__";

/// Separator between subgraph segments in a checkpoint namespace.
pub const NS_SEP: &str = "|";

/// Separator between a namespace segment and its task discriminator.
pub const TASK_SEP: &str = ":";

/// Monotone channel version scalar.
///
/// Versions start at 1 for the first successful write and are generated by
/// [`Checkpointer::next_version`](crate::checkpoint::Checkpointer::next_version);
/// the default generator is `prev + 1`, which keeps replays bit-identical.
pub type Version = u64;

const RESERVED: &[&str] = &[
    START, END, INPUT, INTERRUPT, ERROR, RESUME, SCHEDULED, NO_WRITES, TASKS, COPY,
];

/// Returns `true` if `name` is one of the engine-owned reserved names.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// Returns `true` if `name` is usable as a user node or channel name:
/// non-empty, not reserved, and free of namespace separators.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !is_reserved(name) && !name.contains(NS_SEP) && !name.contains(TASK_SEP)
}

/// Sentinel channels interpreted by the planner/loop rather than reduced into
/// user state.
#[must_use]
pub fn is_sentinel_channel(name: &str) -> bool {
    matches!(name, INTERRUPT | ERROR | RESUME | SCHEDULED | NO_WRITES | TASKS)
}

/// Join a parent namespace with a child segment.
#[must_use]
pub fn child_namespace(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{NS_SEP}{segment}")
    }
}
