/*!
SQLite checkpointer.

Durable implementation of the `Checkpointer` trait on top of an async
`sqlx` pool. Checkpoints and pending writes live in two tables keyed by
`(thread_id, checkpoint_ns, checkpoint_id)`; both store the canonical JSON
serialization of the in-memory types, so the persisted layout is identical
to every other backend.

When the `sqlite-migrations` feature is enabled (default), embedded
migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling the
feature assumes external migration orchestration.

Maintenance is the deployment's concern: the schema carries timestamps so
time-based cleanup (`DELETE FROM checkpoints WHERE ts < …; VACUUM`) stays a
one-liner.
*/

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use rustc_hash::FxHashMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite,
};
use super::checkpointer::{CheckpointerError, Checkpointer, ListOptions, Result};
use crate::types::Version;

/// SQLite-backed checkpointer with full thread history.
pub struct SqliteSaver {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSaver").finish()
    }
}

fn backend(context: &str, err: impl std::fmt::Display) -> CheckpointerError {
    CheckpointerError::Backend {
        message: format!("{context}: {err}"),
    }
}

impl SqliteSaver {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://stepweave.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Ensure the underlying file exists; SqlitePool does not create it.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend("connect", e))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| backend("migration", e))?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Resolve the database URL from `STEPWEAVE_SQLITE_URL` (via dotenv) and
    /// connect; falls back to `sqlite://stepweave.db`.
    pub async fn connect_from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let url = std::env::var("STEPWEAVE_SQLITE_URL")
            .unwrap_or_else(|_| "sqlite://stepweave.db".to_string());
        Self::connect(&url).await
    }

    fn decode_tuple(config: &CheckpointConfig, row: &SqliteRow) -> Result<CheckpointTuple> {
        let checkpoint_id: String = row.get("checkpoint_id");
        let checkpoint_json: String = row.get("checkpoint_json");
        let metadata_json: String = row.get("metadata_json");
        let parent_id: Option<String> = row.get("parent_checkpoint_id");

        let checkpoint: Checkpoint = serde_json::from_str(&checkpoint_json)
            .map_err(|source| CheckpointerError::Serde { source })?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)
            .map_err(|source| CheckpointerError::Serde { source })?;
        Ok(CheckpointTuple {
            config: config.at(&checkpoint_id),
            checkpoint,
            metadata,
            parent_config: parent_id.map(|parent| config.at(parent)),
            pending_writes: Vec::new(),
        })
    }

    async fn load_writes(
        &self,
        config: &CheckpointConfig,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, channel, value_json
            FROM checkpoint_writes
            WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
            ORDER BY task_id, idx
            "#,
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select writes", e))?;

        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.get("task_id");
            let channel: String = row.get("channel");
            let value_json: String = row.get("value_json");
            let value = serde_json::from_str(&value_json)
                .map_err(|source| CheckpointerError::Serde { source })?;
            writes.push(PendingWrite {
                task_id,
                channel,
                value,
            });
        }
        Ok(writes)
    }
}

#[async_trait]
impl Checkpointer for SqliteSaver {
    #[instrument(skip(self), err)]
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let row = match &config.checkpoint_id {
            Some(id) => sqlx::query(
                r#"
                SELECT checkpoint_id, parent_checkpoint_id, checkpoint_json, metadata_json
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
                "#,
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select checkpoint", e))?,
            None => sqlx::query(
                r#"
                SELECT checkpoint_id, parent_checkpoint_id, checkpoint_json, metadata_json
                FROM checkpoints
                WHERE thread_id = ?1 AND checkpoint_ns = ?2
                ORDER BY checkpoint_id DESC
                LIMIT 1
                "#,
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select latest", e))?,
        };

        let Some(row) = row else {
            return Ok(None);
        };
        let mut tuple = Self::decode_tuple(config, &row)?;
        let id = tuple
            .config
            .checkpoint_id
            .clone()
            .unwrap_or_default();
        tuple.pending_writes = self.load_writes(config, &id).await?;
        Ok(Some(tuple))
    }

    #[instrument(skip(self, options), err)]
    async fn list(
        &self,
        config: &CheckpointConfig,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<CheckpointTuple>>> {
        let rows = sqlx::query(
            r#"
            SELECT checkpoint_id, parent_checkpoint_id, checkpoint_json, metadata_json
            FROM checkpoints
            WHERE thread_id = ?1 AND checkpoint_ns = ?2
            ORDER BY checkpoint_id DESC
            "#,
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select history", e))?;

        let mut tuples = Vec::new();
        for row in rows {
            let mut tuple = Self::decode_tuple(config, &row)?;
            let id = tuple.config.checkpoint_id.clone().unwrap_or_default();
            if let Some(before) = &options.before {
                if id.as_str() >= before.as_str() {
                    continue;
                }
            }
            if !options.matches(&tuple.metadata) {
                continue;
            }
            tuple.pending_writes = self.load_writes(config, &id).await?;
            tuples.push(tuple);
            if options.limit.is_some_and(|limit| tuples.len() >= limit) {
                break;
            }
        }
        Ok(stream::iter(tuples.into_iter().map(Ok)).boxed())
    }

    #[instrument(skip(self, checkpoint, metadata, _new_versions), err)]
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: FxHashMap<String, Version>,
    ) -> Result<CheckpointConfig> {
        let checkpoint_json = serde_json::to_string(&checkpoint)
            .map_err(|source| CheckpointerError::Serde { source })?;
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|source| CheckpointerError::Serde { source })?;
        let id = checkpoint.id.clone();

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints (
                thread_id, checkpoint_ns, checkpoint_id,
                parent_checkpoint_id, ts, checkpoint_json, metadata_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(&id)
        .bind(&config.checkpoint_id)
        .bind(checkpoint.ts.to_rfc3339())
        .bind(&checkpoint_json)
        .bind(&metadata_json)
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("insert checkpoint", e))?;

        Ok(config.at(id))
    }

    #[instrument(skip(self, writes), err)]
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        for (seq, write) in writes.into_iter().enumerate() {
            let idx = super::checkpointer::pending_write_idx(&write.channel, seq);
            let value_json = serde_json::to_string(&write.value)
                .map_err(|source| CheckpointerError::Serde { source })?;
            // INSERT OR REPLACE keyed by (…, task_id, idx) keeps retried
            // commits idempotent.
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO checkpoint_writes (
                    thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, value_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .bind(checkpoint_id)
            .bind(task_id)
            .bind(idx as i64)
            .bind(&write.channel)
            .bind(&value_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("insert write", e))?;
        }
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("delete writes", e))?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("delete checkpoints", e))?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }
}
