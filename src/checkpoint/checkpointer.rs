use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use crate::types::{self, Version};

/// Storage index for one pending write within its task.
///
/// Sentinel channels get fixed slots well above any data-write index, so a
/// resumed or retried task overwrites its own data writes without clobbering
/// interrupt/resume records (and vice versa). Backends key rows by
/// `(task_id, idx)`.
#[must_use]
pub fn pending_write_idx(channel: &str, seq: usize) -> usize {
    const SENTINEL_BASE: usize = 1 << 32;
    const WINDOW: usize = 1 << 16;
    match channel {
        types::ERROR => SENTINEL_BASE + seq,
        types::INTERRUPT => SENTINEL_BASE + WINDOW + seq,
        types::RESUME => SENTINEL_BASE + 2 * WINDOW + seq,
        types::SCHEDULED => SENTINEL_BASE + 3 * WINDOW + seq,
        types::NO_WRITES => SENTINEL_BASE + 4 * WINDOW + seq,
        _ => seq,
    }
}

/// Errors from checkpointer operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CheckpointerError {
    /// The addressed thread or checkpoint does not exist.
    #[error("checkpoint not found: thread `{thread_id}`")]
    #[diagnostic(
        code(stepweave::checkpointer::not_found),
        help("Ensure the thread id `{thread_id}` is correct and has committed at least once.")
    )]
    NotFound { thread_id: String },

    /// Backend storage error (database, filesystem, etc.).
    #[error("backend error: {message}")]
    #[diagnostic(
        code(stepweave::checkpointer::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Serialization failure while encoding or decoding persisted shapes.
    #[error("serialization error: {source}")]
    #[diagnostic(code(stepweave::checkpointer::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    /// Other checkpointer errors.
    #[error("checkpointer error: {message}")]
    #[diagnostic(code(stepweave::checkpointer::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Options for [`Checkpointer::list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only return checkpoints strictly older than this checkpoint id.
    pub before: Option<String>,
    /// Maximum number of tuples to yield.
    pub limit: Option<usize>,
    /// Metadata equality filter: every `(key, value)` must match the
    /// serialized metadata object.
    pub filter: Option<FxHashMap<String, Value>>,
}

impl ListOptions {
    pub(crate) fn matches(&self, metadata: &CheckpointMetadata) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        let Ok(Value::Object(meta)) = serde_json::to_value(metadata) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| meta.get(key) == Some(expected))
    }
}

/// Durable storage for checkpoints and per-task pending writes.
///
/// # Guarantees required from implementations
///
/// - `put` is atomic per `(thread_id, checkpoint_ns, checkpoint_id)` and
///   sequenced per thread.
/// - `put_writes` is append-only and idempotent by `(task_id, idx)`: retrying
///   the same task's writes overwrites rather than duplicates.
/// - `list` yields tuples in reverse chronological order.
/// - Concurrent `put_writes` with distinct task ids must be tolerated.
#[async_trait]
pub trait Checkpointer: Send + Sync + std::fmt::Debug {
    /// Load the addressed checkpoint (latest when `checkpoint_id` is unset),
    /// or `None` when the thread has no checkpoints.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Stream checkpoints for a thread, newest first.
    async fn list(
        &self,
        config: &CheckpointConfig,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<CheckpointTuple>>>;

    /// Persist a checkpoint. `config` addresses the parent (its
    /// `checkpoint_id` becomes the new checkpoint's parent); the returned
    /// config addresses the stored checkpoint.
    ///
    /// `new_versions` carries the channel versions minted since the parent,
    /// for backends that index by version.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: FxHashMap<String, Version>,
    ) -> Result<CheckpointConfig>;

    /// Append one task's writes to the addressed checkpoint.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        task_id: &str,
    ) -> Result<()>;

    /// Remove every checkpoint and pending write of a thread, across all
    /// namespaces.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Mint the next version for a mutated channel. The default generator is
    /// `prev + 1`; overrides must stay monotone and deterministic, or replay
    /// equality breaks.
    fn next_version(&self, prev: Option<Version>) -> Version {
        prev.unwrap_or(0) + 1
    }
}
