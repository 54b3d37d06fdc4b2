//! Checkpoint data model and persistence.
//!
//! A [`Checkpoint`] is the immutable record of all channel state at a
//! superstep boundary; a [`Checkpointer`] persists checkpoints and the
//! per-task [`PendingWrite`]s that bridge the gap between "task completed"
//! and "next checkpoint committed". Two implementations ship with the crate:
//! the volatile [`InMemorySaver`] and, behind the `sqlite` feature, the
//! durable [`SqliteSaver`].

mod checkpoint;
mod checkpointer;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointTuple,
    PendingWrite,
};
pub use checkpointer::{CheckpointerError, Checkpointer, ListOptions, Result, pending_write_idx};
pub use memory::InMemorySaver;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSaver;
