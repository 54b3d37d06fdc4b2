use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::json;

use stepweave::channels::LastValue;
use stepweave::checkpoint::{Checkpoint, PendingWrite};
use stepweave::command::Send as SendPayload;
use stepweave::graph::{GraphSpec, NodeSpec};
use stepweave::schedulers::plan_step;
use stepweave::types::{ERROR, INTERRUPT, NO_WRITES, RESUME, START, TASKS};

mod common;
use common::fixtures;
use common::nodes::WriteNode;

fn seeded_checkpoint() -> Checkpoint {
    let mut checkpoint = Checkpoint::empty();
    checkpoint.channel_versions.insert(START.to_string(), 1);
    checkpoint
}

#[test]
fn subscription_task_fires_on_fresh_trigger_version() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    assert_eq!(plan.tasks.len(), 1);
    let task = &plan.tasks[0];
    assert_eq!(task.name, "inc");
    assert_eq!(task.triggers, vec![START.to_string()]);
    // Single-channel subscription projects the bare value (count default).
    assert_eq!(task.input, json!(0));
    assert_eq!(plan.seen_updates["inc"][START], 1);
}

#[test]
fn seen_version_suppresses_refire() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let mut checkpoint = seeded_checkpoint();
    checkpoint
        .versions_seen
        .entry("inc".to_string())
        .or_default()
        .insert(START.to_string(), 1);

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 1).expect("plan");
    assert!(plan.tasks.is_empty());
}

#[test]
fn plan_is_deterministic_for_same_checkpoint() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let a = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let b = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let ids_a: Vec<_> = a.tasks.iter().map(|t| t.id.clone()).collect();
    let ids_b: Vec<_> = b.tasks.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids_a, ids_b);
}

#[test]
fn empty_subscribed_channel_skips_node_without_error() {
    let graph = GraphSpec::new(
        vec![
            NodeSpec::new("needs_answer", Arc::new(WriteNode { writes: vec![] }))
                .with_channels(["answer"]),
        ],
        vec![("answer".to_string(), Box::new(LastValue::new()))],
        vec![],
        vec![],
    )
    .expect("graph compiles");
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    assert!(plan.tasks.is_empty(), "empty required channel skips the node");
}

#[test]
fn pending_sends_become_push_tasks() {
    let graph = fixtures::dispatch_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .pending_sends
        .push(SendPayload::new("worker", json!({"job": 1})));
    checkpoint
        .pending_sends
        .push(SendPayload::new("worker", json!({"job": 2})));

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 1).expect("plan");
    assert_eq!(plan.tasks.len(), 2);
    for (i, task) in plan.tasks.iter().enumerate() {
        assert_eq!(task.name, "worker");
        assert_eq!(task.triggers, vec![TASKS.to_string()]);
        assert_eq!(task.input, json!({"job": i + 1}));
    }
    assert_ne!(plan.tasks[0].id, plan.tasks[1].id);
}

#[test]
fn unknown_send_target_is_an_error() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .pending_sends
        .push(SendPayload::new("ghost", json!(null)));

    assert!(plan_step(&graph, &channels, &checkpoint, &[], 0).is_err());
}

#[test]
fn completed_task_is_replayed_not_rerun() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let task_id = plan.tasks[0].id.clone();

    let writes = vec![PendingWrite::new(&task_id, "count", json!(1))];
    let replanned = plan_step(&graph, &channels, &checkpoint, &writes, 0).expect("plan");
    let cached = replanned.tasks[0]
        .cached_writes
        .as_ref()
        .expect("completed task carries its writes");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].channel, "count");
}

#[test]
fn no_writes_marker_counts_as_completed() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let task_id = plan.tasks[0].id.clone();

    let writes = vec![PendingWrite::new(&task_id, NO_WRITES, json!(null))];
    let replanned = plan_step(&graph, &channels, &checkpoint, &writes, 0).expect("plan");
    assert!(
        replanned.tasks[0]
            .cached_writes
            .as_ref()
            .is_some_and(|writes| writes.is_empty())
    );
}

#[test]
fn surfaced_error_drops_the_task() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let task_id = plan.tasks[0].id.clone();

    let writes = vec![PendingWrite::new(
        &task_id,
        ERROR,
        json!({"name": "inc", "message": "boom"}),
    )];
    let replanned = plan_step(&graph, &channels, &checkpoint, &writes, 0).expect("plan");
    assert!(replanned.tasks.is_empty());
}

#[test]
fn interrupted_task_reruns_with_resume_values() {
    let (graph, _) = fixtures::counter_graph();
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let task_id = plan.tasks[0].id.clone();

    let writes = vec![
        PendingWrite::new(
            &task_id,
            INTERRUPT,
            json!({"value": "confirm?", "task_id": task_id, "index": 0}),
        ),
        PendingWrite::new(&task_id, RESUME, json!("yes")),
    ];
    let replanned = plan_step(&graph, &channels, &checkpoint, &writes, 0).expect("plan");
    assert_eq!(replanned.tasks.len(), 1);
    let task = &replanned.tasks[0];
    assert!(task.cached_writes.is_none(), "interrupted tasks re-run");
    assert_eq!(task.resume_values, vec![json!("yes")]);
}

#[test]
fn deferred_node_waits_for_eager_work_to_drain() {
    let graph = GraphSpec::new(
        vec![
            NodeSpec::new(
                "eager",
                Arc::new(WriteNode {
                    writes: vec![("out".into(), json!("eager"))],
                }),
            ),
            NodeSpec::new(
                "late",
                Arc::new(WriteNode {
                    writes: vec![("out".into(), json!("late"))],
                }),
            )
            .deferred(),
        ],
        vec![("out".to_string(), Box::new(LastValue::new()))],
        vec![],
        vec![],
    )
    .expect("graph compiles");
    let channels = graph.materialize(&FxHashMap::default()).expect("materialize");
    let checkpoint = seeded_checkpoint();

    let plan = plan_step(&graph, &channels, &checkpoint, &[], 0).expect("plan");
    let names: Vec<_> = plan.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["eager"], "deferred node held back");
    assert!(!plan.seen_updates.contains_key("late"));

    // Once the eager node has seen its trigger, only the deferred one fires.
    let mut settled = checkpoint.clone();
    settled
        .versions_seen
        .entry("eager".to_string())
        .or_default()
        .insert(START.to_string(), 1);
    let plan = plan_step(&graph, &channels, &settled, &[], 1).expect("plan");
    let names: Vec<_> = plan.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["late"]);
}
