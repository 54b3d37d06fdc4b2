use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::Send as SendPayload;
use crate::types::Version;

/// Immutable snapshot of all channel state at a superstep boundary.
///
/// The serde serialization of this struct is the canonical persisted layout:
/// every checkpointer backend stores exactly this shape, keyed by
/// `(thread_id, checkpoint_ns, checkpoint_id)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Opaque, time-ordered id (UUIDv7), so lexicographic order is
    /// chronological order.
    pub id: String,
    pub ts: DateTime<Utc>,
    /// Channel snapshots; absent keys mean the channel was never written.
    pub channel_values: FxHashMap<String, Value>,
    /// Monotone per-channel versions.
    pub channel_versions: FxHashMap<String, Version>,
    /// Per node, the last channel versions it has observed. Drives
    /// subscription planning.
    pub versions_seen: FxHashMap<String, FxHashMap<String, Version>>,
    /// Dynamic tasks enqueued for the next superstep.
    #[serde(default)]
    pub pending_sends: Vec<SendPayload>,
}

impl Checkpoint {
    /// Fresh empty checkpoint with a new time-ordered id.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: Self::next_id(),
            ts: Utc::now(),
            channel_values: FxHashMap::default(),
            channel_versions: FxHashMap::default(),
            versions_seen: FxHashMap::default(),
            pending_sends: Vec::new(),
        }
    }

    #[must_use]
    pub fn next_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Copy of this checkpoint under a new id and timestamp, used both for
    /// per-step commits and for `__copy__` forks.
    #[must_use]
    pub fn advance(&self) -> Self {
        Self {
            id: Self::next_id(),
            ts: Utc::now(),
            channel_values: self.channel_values.clone(),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            pending_sends: self.pending_sends.clone(),
        }
    }

    /// Highest version across all channels, or `None` when unwritten.
    #[must_use]
    pub fn max_version(&self) -> Option<Version> {
        self.channel_versions.values().copied().max()
    }
}

/// Why a checkpoint was committed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Committed by the loop at a superstep boundary.
    Loop,
    /// Committed while seeding graph input.
    Input,
    /// Committed by the state API (`update_state`).
    Update,
    /// Committed by a time-travel fork.
    Fork,
}

/// Metadata persisted beside every checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// Superstep number; `-1` for the input seed of a fresh thread.
    pub step: i64,
    /// Parent checkpoint ids keyed by namespace, recording fork lineage.
    #[serde(default)]
    pub parents: FxHashMap<String, String>,
}

impl CheckpointMetadata {
    #[must_use]
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            parents: FxHashMap::default(),
        }
    }
}

/// Addressing for one thread of checkpoints.
///
/// `checkpoint_id = None` addresses the latest checkpoint of the thread.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckpointConfig {
    pub thread_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    #[must_use]
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Same thread and namespace, pointing at a specific checkpoint.
    #[must_use]
    pub fn at(&self, checkpoint_id: impl Into<String>) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint_id.into()),
        }
    }

    /// Same thread and namespace, addressing the latest checkpoint.
    #[must_use]
    pub fn latest(&self) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: None,
        }
    }
}

/// One buffered task write, persisted separately from checkpoints so partial
/// progress survives a crash between commits.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: Value,
}

impl PendingWrite {
    #[must_use]
    pub fn new(task_id: impl Into<String>, channel: impl Into<String>, value: Value) -> Self {
        Self {
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Everything a checkpointer knows about one checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<CheckpointConfig>,
    /// Writes appended after this checkpoint committed, ordered by
    /// `(task_id, idx)`.
    pub pending_writes: Vec<PendingWrite>,
}
