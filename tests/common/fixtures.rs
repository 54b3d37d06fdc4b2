//! Graph fixtures shared across integration tests.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use serde_json::json;

use stepweave::channels::{BinaryOperatorAggregate, Concat, LastValue, Sum, Topic};
use stepweave::graph::{GraphSpec, NodeSpec};
use stepweave::node::CachePolicy;

use super::nodes::{AskNode, DispatchNode, EchoNode, FlakyNode, IncrementNode, SlowNode, WriteNode};

fn count_channel() -> (String, stepweave::channels::BoxedChannel) {
    (
        "count".to_string(),
        Box::new(BinaryOperatorAggregate::new(Arc::new(Sum), Some(json!(0)))),
    )
}

/// `START -> inc -> END`: one superstep, `count += 1`.
pub fn counter_graph() -> (GraphSpec, Arc<AtomicUsize>) {
    let (inc, runs) = IncrementNode::new(1);
    let graph = GraphSpec::new(
        vec![NodeSpec::new("inc", Arc::new(inc)).with_channels(["count"])],
        vec![count_channel()],
        vec!["count".into()],
        vec!["count".into()],
    )
    .expect("counter graph compiles");
    (graph, runs)
}

/// `inc` also triggers on its own `count` writes, so the graph never
/// settles; used with a recursion limit.
pub fn counter_loop_graph() -> (GraphSpec, Arc<AtomicUsize>) {
    let (inc, runs) = IncrementNode::new(1);
    let graph = GraphSpec::new(
        vec![
            NodeSpec::new("inc", Arc::new(inc))
                .with_triggers([stepweave::types::START, "count"])
                .with_channels(["count"]),
        ],
        vec![count_channel()],
        vec!["count".into()],
        vec!["count".into()],
    )
    .expect("counter loop graph compiles");
    (graph, runs)
}

/// Single `ask` node that interrupts for confirmation.
pub fn interrupt_graph() -> GraphSpec {
    GraphSpec::new(
        vec![NodeSpec::new("ask", Arc::new(AskNode))],
        vec![("answer".to_string(), Box::new(LastValue::new()))],
        vec![],
        vec!["answer".into()],
    )
    .expect("interrupt graph compiles")
}

/// `START -> {a, b} -> join` over a concat-reduced `xs` channel.
pub fn fanout_graph() -> GraphSpec {
    GraphSpec::new(
        vec![
            NodeSpec::new(
                "a",
                Arc::new(WriteNode {
                    writes: vec![("xs".into(), json!([1]))],
                }),
            ),
            NodeSpec::new(
                "b",
                Arc::new(WriteNode {
                    writes: vec![("xs".into(), json!([2]))],
                }),
            ),
            NodeSpec::new(
                "join",
                Arc::new(EchoNode {
                    channel: "seen".into(),
                }),
            )
            .with_triggers(["xs"])
            .with_channels(["xs"]),
        ],
        vec![
            (
                "xs".to_string(),
                Box::new(BinaryOperatorAggregate::new(
                    Arc::new(Concat),
                    Some(json!([])),
                )),
            ),
            ("seen".to_string(), Box::new(LastValue::new())),
        ],
        vec![],
        vec!["xs".into(), "seen".into()],
    )
    .expect("fanout graph compiles")
}

/// Flaky node with a retry policy: fails `failures` times, then succeeds.
pub fn flaky_graph(failures: usize, max_attempts: u32) -> (GraphSpec, Arc<AtomicUsize>) {
    let (flaky, attempts) = FlakyNode::new(failures);
    let graph = GraphSpec::new(
        vec![
            NodeSpec::new("flaky", Arc::new(flaky))
                .with_retry(stepweave::schedulers::immediate_retry(max_attempts)),
        ],
        vec![count_channel()],
        vec![],
        vec!["count".into()],
    )
    .expect("flaky graph compiles");
    (graph, attempts)
}

/// Node that takes `delay` to finish; for timeout/cancellation tests.
pub fn slow_graph(delay: Duration) -> (GraphSpec, Arc<AtomicUsize>) {
    let (slow, completed) = SlowNode::new(delay);
    let graph = GraphSpec::new(
        vec![NodeSpec::new("slow", Arc::new(slow))],
        vec![count_channel()],
        vec![],
        vec!["count".into()],
    )
    .expect("slow graph compiles");
    (graph, completed)
}

/// `dispatch` fans jobs out to `worker` through dynamic sends; results
/// accumulate on a topic.
pub fn dispatch_graph() -> GraphSpec {
    GraphSpec::new(
        vec![
            NodeSpec::new("dispatch", Arc::new(DispatchNode)).with_channels(["jobs"]),
            // Push-only node: no subscriptions, dispatched through sends.
            NodeSpec::new(
                "worker",
                Arc::new(EchoNode {
                    channel: "results".into(),
                }),
            )
            .with_triggers(Vec::<String>::new()),
        ],
        vec![
            ("jobs".to_string(), Box::new(LastValue::new())),
            ("results".to_string(), Box::new(Topic::new(true))),
        ],
        vec!["jobs".into()],
        vec!["results".into()],
    )
    .expect("dispatch graph compiles")
}

/// Counter graph whose node is memoized through the task cache.
pub fn cached_counter_graph() -> (GraphSpec, Arc<AtomicUsize>) {
    let (inc, runs) = IncrementNode::new(1);
    let graph = GraphSpec::new(
        vec![
            NodeSpec::new("inc", Arc::new(inc))
                .with_channels(["count"])
                .with_cache(CachePolicy::new(None)),
        ],
        vec![count_channel()],
        vec!["count".into()],
        vec!["count".into()],
    )
    .expect("cached counter graph compiles");
    (graph, runs)
}
