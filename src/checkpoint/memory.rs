use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use super::checkpointer::{CheckpointerError, Checkpointer, ListOptions, Result};
use crate::types::Version;

#[derive(Clone, Debug)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_id: Option<String>,
}

type ThreadKey = (String, String);
type WriteKey = (String, usize);

/// Volatile in-process checkpointer.
///
/// Checkpoints are held per `(thread_id, checkpoint_ns)` in a `BTreeMap`
/// keyed by checkpoint id; ids are UUIDv7, so map order is chronological
/// order and "latest" is the last entry. Suitable for tests and ephemeral
/// runs; nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemorySaver {
    checkpoints: RwLock<FxHashMap<ThreadKey, BTreeMap<String, StoredCheckpoint>>>,
    writes: RwLock<FxHashMap<(String, String, String), BTreeMap<WriteKey, PendingWrite>>>,
}

impl InMemorySaver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tuple_for(
        &self,
        config: &CheckpointConfig,
        id: &str,
        stored: &StoredCheckpoint,
    ) -> CheckpointTuple {
        let writes = self.writes.read();
        let key = (
            config.thread_id.clone(),
            config.checkpoint_ns.clone(),
            id.to_string(),
        );
        let pending_writes = writes
            .get(&key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        CheckpointTuple {
            config: config.at(id),
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent_config: stored.parent_id.as_ref().map(|parent| config.at(parent)),
            pending_writes,
        }
    }
}

#[async_trait]
impl Checkpointer for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let entry = {
            let map = self.checkpoints.read();
            let Some(thread) = map.get(&key) else {
                return Ok(None);
            };
            match &config.checkpoint_id {
                Some(id) => thread.get(id).map(|stored| (id.clone(), stored.clone())),
                None => thread
                    .iter()
                    .next_back()
                    .map(|(id, stored)| (id.clone(), stored.clone())),
            }
        };
        Ok(entry.map(|(id, stored)| self.tuple_for(config, &id, &stored)))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<CheckpointTuple>>> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let entries: Vec<(String, StoredCheckpoint)> = {
            let map = self.checkpoints.read();
            map.get(&key)
                .map(|thread| {
                    thread
                        .iter()
                        .rev()
                        .map(|(id, stored)| (id.clone(), stored.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut tuples = Vec::new();
        for (id, stored) in entries {
            if let Some(before) = &options.before {
                if id.as_str() >= before.as_str() {
                    continue;
                }
            }
            if !options.matches(&stored.metadata) {
                continue;
            }
            tuples.push(self.tuple_for(config, &id, &stored));
            if options.limit.is_some_and(|limit| tuples.len() >= limit) {
                break;
            }
        }
        Ok(stream::iter(tuples.into_iter().map(Ok)).boxed())
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: FxHashMap<String, Version>,
    ) -> Result<CheckpointConfig> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let id = checkpoint.id.clone();
        let stored = StoredCheckpoint {
            checkpoint,
            metadata,
            parent_id: config.checkpoint_id.clone(),
        };
        self.checkpoints
            .write()
            .entry(key)
            .or_default()
            .insert(id.clone(), stored);
        Ok(config.at(id))
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        task_id: &str,
    ) -> Result<()> {
        let Some(checkpoint_id) = &config.checkpoint_id else {
            return Err(CheckpointerError::Other {
                message: "put_writes requires a checkpoint_id in the config".to_string(),
            });
        };
        let key = (
            config.thread_id.clone(),
            config.checkpoint_ns.clone(),
            checkpoint_id.clone(),
        );
        let mut map = self.writes.write();
        let rows = map.entry(key).or_default();
        // Idempotent by (task_id, idx): a retried commit overwrites in place.
        for (seq, write) in writes.into_iter().enumerate() {
            let idx = super::checkpointer::pending_write_idx(&write.channel, seq);
            rows.insert((task_id.to_string(), idx), write);
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.checkpoints
            .write()
            .retain(|(thread, _), _| thread != thread_id);
        self.writes
            .write()
            .retain(|(thread, _, _), _| thread != thread_id);
        Ok(())
    }
}
