//! # stepweave: a superstep graph runtime
//!
//! stepweave executes stateful, multi-actor computations expressed as a
//! directed graph of nodes that communicate by reading and writing shared,
//! typed, versioned channels. Execution proceeds in discrete synchronous
//! rounds (supersteps); state persists to a checkpointer between rounds;
//! intermediate output streams to consumers through a back-pressured bus;
//! runs can pause on interrupts and resume deterministically.
//!
//! ## Core concepts
//!
//! - **Channels**: versioned state cells with deterministic reducers
//!   ([`channels`])
//! - **Nodes**: async units of user code returning channel updates or
//!   commands ([`node`])
//! - **Graph**: a compiled, immutable description of nodes, subscriptions,
//!   and channel declarations ([`graph`])
//! - **Loop**: the superstep driver (plan, execute, apply, commit)
//!   ([`runtimes`])
//! - **Checkpoints**: crash-safe, resumable snapshots with per-task pending
//!   writes ([`checkpoint`])
//! - **Stream bus**: multiplexed `(namespace, mode, payload)` events with
//!   real back-pressure ([`stream`])
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use stepweave::app::App;
//! use stepweave::channels::{BinaryOperatorAggregate, Sum};
//! use stepweave::graph::{GraphSpec, NodeSpec};
//! use stepweave::node::{Node, NodeContext, NodeError, NodeOutput};
//! use stepweave::runtimes::RunConfig;
//!
//! struct Increment;
//!
//! #[async_trait]
//! impl Node for Increment {
//!     async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!         Ok(NodeOutput::write("count", json!(1)))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = GraphSpec::new(
//!     vec![NodeSpec::new("inc", Arc::new(Increment)).with_channels(["count"])],
//!     vec![(
//!         "count".into(),
//!         Box::new(BinaryOperatorAggregate::new(Arc::new(Sum), Some(json!(0)))),
//!     )],
//!     vec!["count".into()],
//!     vec!["count".into()],
//! )?;
//!
//! let app = App::new(graph);
//! let outcome = app.invoke(json!({"count": 0}), RunConfig::default()).await?;
//! assert_eq!(outcome.values, json!({"count": 1}));
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution model
//!
//! One tick of the loop plans tasks against the last committed checkpoint,
//! runs them concurrently (no task observes another task's writes), applies
//! every buffered write through the channel reducers at the barrier, and
//! commits a new checkpoint. Task ids are content-addressed to the checkpoint
//! they run against, and each task's writes persist before the next commit,
//! so a crashed or interrupted run replays to the exact same state.

pub mod app;
pub mod channels;
pub mod checkpoint;
pub mod command;
pub mod graph;
pub mod node;
pub mod runtimes;
pub mod schedulers;
pub mod store;
pub mod stream;
pub mod types;
