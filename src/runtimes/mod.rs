//! Invocation runtime: the superstep loop, run options, and the state API.
//!
//! # Architecture
//!
//! - **[`GraphRunner`]** - drives one invocation tick by tick
//! - **[`RunConfig`]** - per-invocation options (stream modes, durability,
//!   interrupts, limits, thread addressing)
//! - **state API** - checkpoint-based inspection and structured updates
//!
//! Most callers go through [`crate::app::App`], which binds a compiled graph
//! to a checkpointer and constructs runners on demand.

mod config;
mod runner;
mod state;

pub use config::{CheckpointerOption, Durability, InterruptNodes, RunConfig};
pub use runner::{GraphRunner, LoopError, RunOutcome, RunStatus};
pub use state::{
    StateError, StateSnapshot, StateUpdate, TaskInfo, bulk_update_state, get_state,
    get_state_history, update_state,
};
