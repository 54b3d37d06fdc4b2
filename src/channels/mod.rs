//! Versioned state cells for the stepweave runtime.
//!
//! A channel owns a single value and a reduction rule for folding updates
//! into it. The loop is the only mutator: task writes are buffered during a
//! superstep and applied here at the barrier, one `update` batch per channel
//! per step. Channels know nothing about versions; the loop assigns a new
//! version through the checkpointer whenever `update` reports a change.
//!
//! # Variants
//!
//! - [`LastValue`]: most recent write wins; rejects competing writers in one
//!   step.
//! - [`LastValueAfterFinish`]: same cell, but readable only after the graph
//!   finishes.
//! - [`BinaryOperatorAggregate`]: folds updates with an associative
//!   [`BinaryOperator`].
//! - [`Topic`]: accumulates a list within a superstep; cleared at the
//!   boundary unless declared accumulating.
//! - [`NamedBarrierValue`] / [`NamedBarrierValueAfterFinish`]: become
//!   available once every named member has written.
//! - [`EphemeralValue`]: lives for exactly one superstep.
//!
//! # Snapshots
//!
//! `checkpoint()` returns `None` for a never-written channel and a lossless
//! JSON snapshot otherwise; `from_snapshot(checkpoint())` yields an equal
//! channel. Channels are prototypes: the compiled graph holds one instance
//! per declaration and every invocation materializes fresh copies through
//! `from_snapshot`.

pub mod errors;

mod barrier;
mod binop;
mod ephemeral;
mod last_value;
mod topic;

pub use barrier::{NamedBarrierValue, NamedBarrierValueAfterFinish};
pub use binop::{BinaryOperator, BinaryOperatorAggregate, Concat, MapMerge, Sum};
pub use ephemeral::EphemeralValue;
pub use errors::ChannelError;
pub use last_value::{LastValue, LastValueAfterFinish};
pub use topic::Topic;

use serde_json::Value;

/// Boxed channel trait object, the unit stored in graph specs and loops.
pub type BoxedChannel = Box<dyn Channel>;

/// Structural identity of a channel declaration.
///
/// Two declarations for the same channel name are compatible when their kinds
/// are equal; `LastValue` is additionally allowed to coexist with any other
/// declaration as a read-only view (see [`check_compatible`]).
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelKind {
    LastValue,
    LastValueAfterFinish,
    BinaryOperatorAggregate {
        operator: String,
        default: Option<Value>,
    },
    Topic {
        accumulate: bool,
    },
    NamedBarrier {
        names: Vec<String>,
    },
    NamedBarrierAfterFinish {
        names: Vec<String>,
    },
    Ephemeral,
}

/// Typed cell with a reducer, snapshot/restore, and superstep lifecycle
/// hooks.
///
/// Reducers must be deterministic, and associative wherever a channel can be
/// written by more than one task in the same superstep.
pub trait Channel: Send + Sync {
    /// Structural identity used for declaration-conflict checks.
    fn kind(&self) -> ChannelKind;

    /// Apply one batch of updates in order. Returns whether the stored value
    /// changed; the loop bumps the channel version exactly when it did.
    fn update(&mut self, values: Vec<Value>) -> Result<bool, ChannelError>;

    /// Read the current value.
    ///
    /// # Errors
    ///
    /// [`ChannelError::EmptyChannel`] when the channel has never been written
    /// and has no default.
    fn get(&self) -> Result<Value, ChannelError>;

    /// Lossless snapshot of the stored state; `None` means never written.
    fn checkpoint(&self) -> Option<Value>;

    /// Build a fresh channel of this declaration restored from `snapshot`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Snapshot`] when the payload does not match this
    /// channel kind.
    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError>;

    /// Superstep-boundary hook, called after a step in which this channel
    /// triggered a node. Returns whether the stored value changed.
    fn consume(&mut self) -> bool {
        false
    }

    /// Graph-termination hook for after-finish variants. Returns whether the
    /// stored value changed.
    fn finish(&mut self) -> bool {
        false
    }

    /// Declaration equality, used to detect conflicting declarations of the
    /// same channel name.
    fn equals(&self, other: &dyn Channel) -> bool {
        self.kind() == other.kind()
    }
}

/// Declaration-conflict rule for a channel name declared by more than one
/// schema: the declarations must be equal, except that a [`LastValue`] may
/// coexist with any other declaration as a read-only view.
#[must_use]
pub fn check_compatible(existing: &dyn Channel, incoming: &dyn Channel) -> bool {
    if existing.equals(incoming) {
        return true;
    }
    matches!(existing.kind(), ChannelKind::LastValue) || matches!(incoming.kind(), ChannelKind::LastValue)
}
