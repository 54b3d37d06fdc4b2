//! Superstep scheduling: deterministic task planning and concurrent task
//! execution.
//!
//! [`plan_step`] derives the tasks for one round from a checkpoint and its
//! pending writes; [`run_step`] executes them under a bounded worker pool
//! with retries, timeouts, cancellation, and interrupt capture. The loop in
//! [`crate::runtimes`] alternates the two.

mod executor;
mod planner;

pub use executor::{
    StepContext, StepOutcome, TaskResult, TaskStatus, immediate_retry, run_step,
};
pub use planner::{Plan, Task, plan_step};

use miette::Diagnostic;
use thiserror::Error;
use tokio::task::JoinError;

use crate::channels::ChannelError;
use crate::checkpoint::CheckpointerError;

/// Errors from planning or executing a superstep.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    /// A dynamic `Send` addressed a node the graph does not declare.
    #[error("dynamic send targets unknown node `{name}`")]
    #[diagnostic(
        code(stepweave::schedulers::unknown_send_target),
        help("Sends may only target nodes registered in the compiled graph.")
    )]
    UnknownSendTarget { name: String },

    /// A channel failed while projecting task inputs (empty channels are not
    /// errors; they skip the node).
    #[error(transparent)]
    #[diagnostic(code(stepweave::schedulers::channel))]
    Channel(#[from] ChannelError),

    /// The superstep exceeded its wall-clock budget; in-flight tasks were
    /// cancelled.
    #[error("superstep {step} exceeded its timeout")]
    #[diagnostic(code(stepweave::schedulers::step_timeout))]
    StepTimeout { step: i64 },

    /// A worker task panicked or was aborted.
    #[error("worker join error: {0}")]
    #[diagnostic(code(stepweave::schedulers::join))]
    Join(#[from] JoinError),

    /// Persisting pending writes failed fatally.
    #[error(transparent)]
    #[diagnostic(code(stepweave::schedulers::checkpointer))]
    Checkpointer(#[from] CheckpointerError),
}
