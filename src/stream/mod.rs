//! Back-pressured event streaming for graph invocations.
//!
//! The module is organised around a per-invocation [`StreamBus`] with
//! per-subscriber bounded queues, a cloneable [`StreamEmitter`] handed to
//! producers, and the consuming [`StreamReceiver`].

mod bus;
mod event;

pub use bus::{StreamBus, StreamBusMetrics, StreamEmitter, StreamReceiver};
pub use event::{StreamEvent, StreamMode};
