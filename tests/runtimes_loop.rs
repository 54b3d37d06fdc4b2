use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use stepweave::app::App;
use stepweave::checkpoint::{
    CheckpointConfig, Checkpointer, InMemorySaver, ListOptions, PendingWrite,
};
use stepweave::command::{Command, GraphInput};
use stepweave::runtimes::{Durability, InterruptNodes, LoopError, RunConfig, RunStatus};
use stepweave::schedulers::SchedulerError;

mod common;
use common::fixtures;

fn saver() -> Arc<InMemorySaver> {
    Arc::new(InMemorySaver::new())
}

fn thread(id: &str) -> CheckpointConfig {
    CheckpointConfig::new(id)
}

/********************
 * S1: counter with reducer
 ********************/

#[tokio::test]
async fn counter_increments_once_per_superstep() {
    common::init_tracing();
    let (graph, runs) = fixtures::counter_graph();
    let app = App::new(graph);

    let outcome = app
        .invoke(json!({"count": 0}), RunConfig::default())
        .await
        .expect("invoke");

    assert_eq!(outcome.status, RunStatus::Done);
    assert_eq!(outcome.values, json!({"count": 1}));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn self_triggering_counter_hits_recursion_limit_at_three() {
    let (graph, runs) = fixtures::counter_loop_graph();
    let app = App::new(graph).with_checkpointer(saver());

    let err = app
        .invoke(
            json!({"count": 0}),
            RunConfig::for_thread("s1b").with_recursion_limit(3),
        )
        .await
        .expect_err("non-terminal graph must trip the limit");
    assert!(matches!(err, LoopError::RecursionLimit { limit: 3, .. }));

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    let state = app.get_state(&thread("s1b")).await.expect("state");
    assert_eq!(state.values, json!({"count": 3}));
}

#[tokio::test]
async fn recursion_limit_one_with_non_terminal_graph_errors() {
    let (graph, _) = fixtures::counter_loop_graph();
    let app = App::new(graph);

    let err = app
        .invoke(
            json!({"count": 0}),
            RunConfig::default().with_recursion_limit(1),
        )
        .await
        .expect_err("limit 1 must fail");
    assert!(matches!(err, LoopError::RecursionLimit { limit: 1, .. }));
}

/********************
 * S2: interrupt & resume
 ********************/

#[tokio::test]
async fn interrupt_halts_and_resume_completes() {
    let app = App::new(fixtures::interrupt_graph()).with_checkpointer(saver());
    let config = RunConfig::for_thread("s2");

    let first = app.invoke(json!({}), config.clone()).await.expect("invoke");
    match &first.status {
        RunStatus::Interrupted(interrupts) => {
            assert_eq!(interrupts.len(), 1);
            assert_eq!(interrupts[0].value, json!("confirm?"));
            assert_eq!(interrupts[0].index, 0);
        }
        other => panic!("expected interrupt, got {other:?}"),
    }

    let state = app.get_state(&thread("s2")).await.expect("state");
    assert_eq!(state.next, vec!["ask".to_string()]);
    let pending = &state.tasks[0].interrupts;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["value"], json!("confirm?"));

    let second = app
        .invoke(Command::resume(json!("yes")), config)
        .await
        .expect("resume");
    assert_eq!(second.status, RunStatus::Done);
    assert_eq!(second.values, json!({"answer": "yes"}));
}

#[tokio::test]
async fn replaying_recorded_resume_reproduces_final_state() {
    // Replay determinism: a second thread fed the same input and the same
    // resume value lands in the same final state.
    let saver_a = saver();
    let saver_b = saver();
    let mut finals = Vec::new();
    for (thread_id, cp) in [("replay-a", saver_a), ("replay-b", saver_b)] {
        let app = App::new(fixtures::interrupt_graph()).with_checkpointer(cp);
        let config = RunConfig::for_thread(thread_id);
        let first = app.invoke(json!({}), config.clone()).await.expect("invoke");
        assert!(matches!(first.status, RunStatus::Interrupted(_)));
        let second = app
            .invoke(Command::resume(json!("yes")), config)
            .await
            .expect("resume");
        finals.push(second.values);
    }
    assert_eq!(finals[0], finals[1]);
}

#[tokio::test]
async fn resume_without_outstanding_interrupt_is_invalid() {
    let (graph, _) = fixtures::counter_graph();
    let app = App::new(graph).with_checkpointer(saver());
    let config = RunConfig::for_thread("no-interrupt");

    app.invoke(json!({"count": 0}), config.clone())
        .await
        .expect("invoke");
    let err = app
        .invoke(Command::resume(json!("yes")), config)
        .await
        .expect_err("nothing to resume");
    assert!(matches!(err, LoopError::InvalidInput(_)));
}

/********************
 * S3: fan-out / fan-in
 ********************/

#[tokio::test]
async fn fanout_joins_on_multiset_of_writes() {
    let app = App::new(fixtures::fanout_graph()).with_checkpointer(saver());

    let outcome = app
        .invoke(json!({}), RunConfig::for_thread("s3"))
        .await
        .expect("invoke");
    assert_eq!(outcome.status, RunStatus::Done);

    let xs: HashSet<i64> = outcome.values["xs"]
        .as_array()
        .expect("xs is an array")
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    assert_eq!(xs, HashSet::from([1, 2]));

    // join observed the same multiset the checkpoint recorded.
    let seen: HashSet<i64> = outcome.values["seen"]
        .as_array()
        .expect("seen is an array")
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    assert_eq!(seen, xs);
}

/********************
 * S4: crash replay
 ********************/

#[tokio::test]
async fn persisted_writes_replay_exactly_once() {
    let (graph, runs) = fixtures::counter_graph();
    let cp = saver();
    let app = App::new(graph).with_checkpointer(cp.clone());

    // Halt before the node runs so a planned-but-unexecuted task exists.
    let halted = app
        .invoke(
            json!({"count": 0}),
            RunConfig::for_thread("s4")
                .with_interrupt_before(InterruptNodes::Nodes(vec!["inc".into()])),
        )
        .await
        .expect("invoke");
    assert!(matches!(halted.status, RunStatus::Interrupted(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Simulate the crashed attempt: its writes were persisted, the next
    // checkpoint was not.
    let state = app.get_state(&thread("s4")).await.expect("state");
    let task_id = state.tasks[0].id.clone();
    cp.put_writes(
        &state.config,
        vec![PendingWrite::new(&task_id, "count", json!(1))],
        &task_id,
    )
    .await
    .expect("put_writes");

    // Re-invoke: the engine reads the pending writes, applies them exactly
    // once, and proceeds without re-running the node.
    let resumed = app
        .invoke(GraphInput::Empty, RunConfig::for_thread("s4"))
        .await
        .expect("resume");
    assert_eq!(resumed.status, RunStatus::Done);
    assert_eq!(resumed.values, json!({"count": 1}));
    assert_eq!(runs.load(Ordering::SeqCst), 0, "writes replayed, node not re-run");

    // Idempotence: putting the same writes again changes nothing.
    cp.put_writes(
        &state.config,
        vec![PendingWrite::new(&task_id, "count", json!(1))],
        &task_id,
    )
    .await
    .expect("put_writes again");
    let resumed_again = app
        .invoke(GraphInput::Empty, RunConfig::for_thread("s4"))
        .await
        .expect("resume again");
    assert_eq!(resumed_again.values, json!({"count": 1}));
}

/********************
 * Retries & failures
 ********************/

#[tokio::test]
async fn flaky_node_retries_to_success() {
    let (graph, attempts) = fixtures::flaky_graph(2, 3);
    let app = App::new(graph);

    let outcome = app
        .invoke(json!({}), RunConfig::default())
        .await
        .expect("third attempt succeeds");
    assert_eq!(outcome.values, json!({"count": 1}));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_as_task_failure() {
    let (graph, attempts) = fixtures::flaky_graph(5, 2);
    let app = App::new(graph).with_checkpointer(saver());

    let err = app
        .invoke(json!({}), RunConfig::for_thread("fail"))
        .await
        .expect_err("retries exhausted");
    assert!(matches!(err, LoopError::TaskFailed { ref name, .. } if name == "flaky"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // The error write is durable and visible through the state API.
    let state = app.get_state(&thread("fail")).await.expect("state");
    let failed = state
        .tasks
        .iter()
        .find(|t| t.error.is_some())
        .expect("failed task surfaced");
    assert_eq!(failed.error.as_ref().expect("error")["name"], json!("flaky"));
}

#[tokio::test]
async fn step_timeout_cancels_in_flight_tasks() {
    let (graph, completed) = fixtures::slow_graph(Duration::from_secs(5));
    let app = App::new(graph);

    let err = app
        .invoke(
            json!({}),
            RunConfig::default().with_step_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("timeout");
    assert!(matches!(
        err,
        LoopError::Scheduler(SchedulerError::StepTimeout { .. })
    ));
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

/********************
 * S6: cancellation
 ********************/

#[tokio::test]
async fn cancellation_unwinds_and_keeps_last_checkpoint() {
    let (graph, completed) = fixtures::slow_graph(Duration::from_secs(5));
    let cp = saver();
    let app = App::new(graph).with_checkpointer(cp.clone());
    let token = CancellationToken::new();
    let config = RunConfig::for_thread("s6").with_cancel(token.clone());

    let run = app.stream(json!({}), config);
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let outcome = run.join().await.expect("cancel is not an error");
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    // The last committed checkpoint is intact and carries no writes from
    // the cancelled task.
    let state = app.get_state(&thread("s6")).await.expect("state");
    assert_eq!(state.values, json!({"count": 0}));
    let tuple = cp
        .get_tuple(&thread("s6"))
        .await
        .expect("tuple")
        .expect("checkpoint exists");
    assert!(tuple.pending_writes.is_empty());
}

/********************
 * Dynamic sends
 ********************/

#[tokio::test]
async fn dispatch_fans_out_to_push_tasks() {
    let app = App::new(fixtures::dispatch_graph()).with_checkpointer(saver());

    let outcome = app
        .invoke(
            json!({"jobs": [{"job": 1}, {"job": 2}, {"job": 3}]}),
            RunConfig::for_thread("push"),
        )
        .await
        .expect("invoke");
    assert_eq!(outcome.status, RunStatus::Done);

    let results = outcome.values["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    let jobs: HashSet<i64> = results
        .iter()
        .filter_map(|v| v["job"].as_i64())
        .collect();
    assert_eq!(jobs, HashSet::from([1, 2, 3]));
}

/********************
 * Caching
 ********************/

#[tokio::test]
async fn cache_hit_skips_node_execution() {
    let (graph, runs) = fixtures::cached_counter_graph();
    let cache = stepweave::store::InMemoryCache::shared();
    let app = App::new(graph).with_cache(cache);

    let first = app
        .invoke(json!({"count": 0}), RunConfig::default())
        .await
        .expect("invoke");
    assert_eq!(first.values, json!({"count": 1}));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Same input on a fresh thread: served from the cache.
    let second = app
        .invoke(json!({"count": 0}), RunConfig::default())
        .await
        .expect("invoke");
    assert_eq!(second.values, json!({"count": 1}));
    assert_eq!(runs.load(Ordering::SeqCst), 1, "cache hit, node not invoked");
}

/********************
 * Durability & input edge cases
 ********************/

#[tokio::test]
async fn exit_durability_commits_exactly_once() {
    let (graph, _) = fixtures::counter_graph();
    let cp = saver();
    let app = App::new(graph).with_checkpointer(cp.clone());

    app.invoke(
        json!({"count": 0}),
        RunConfig::for_thread("exit").with_durability(Durability::Exit),
    )
    .await
    .expect("invoke");

    let mut history = Vec::new();
    let mut stream = cp
        .list(&thread("exit"), ListOptions::default())
        .await
        .expect("list");
    use futures_util::StreamExt;
    while let Some(tuple) = stream.next().await {
        history.push(tuple.expect("tuple"));
    }
    assert_eq!(history.len(), 1, "exit durability commits only at the end");
    assert_eq!(
        history[0].checkpoint.channel_values.get("count"),
        Some(&json!(1))
    );
}

#[tokio::test]
async fn sync_durability_commits_every_step() {
    let (graph, _) = fixtures::counter_graph();
    let cp = saver();
    let app = App::new(graph).with_checkpointer(cp.clone());

    app.invoke(
        json!({"count": 0}),
        RunConfig::for_thread("sync").with_durability(Durability::Sync),
    )
    .await
    .expect("invoke");

    use futures_util::StreamExt;
    let stream = cp
        .list(&thread("sync"), ListOptions::default())
        .await
        .expect("list");
    let count = stream.count().await;
    // Input seed plus one superstep.
    assert_eq!(count, 2);
}

#[tokio::test]
async fn empty_input_without_checkpoint_is_invalid() {
    let (graph, _) = fixtures::counter_graph();
    let app = App::new(graph).with_checkpointer(saver());

    let err = app
        .invoke(GraphInput::Empty, RunConfig::for_thread("fresh"))
        .await
        .expect_err("nothing to resume");
    assert!(matches!(err, LoopError::InvalidInput(_)));
}

#[tokio::test]
async fn empty_input_with_pending_writes_advances_one_step() {
    // An interrupted thread re-invoked with no input still makes progress.
    let app = App::new(fixtures::interrupt_graph()).with_checkpointer(saver());
    let config = RunConfig::for_thread("advance");

    app.invoke(json!({}), config.clone()).await.expect("invoke");
    let resumed = app
        .invoke(Command::resume(json!("ok")), config.clone())
        .await
        .expect("resume");
    assert_eq!(resumed.status, RunStatus::Done);

    // And a further empty re-invoke of a settled thread stays settled.
    let settled = app
        .invoke(GraphInput::Empty, config)
        .await
        .expect("idempotent");
    assert_eq!(settled.status, RunStatus::Done);
    assert_eq!(settled.values, json!({"answer": "ok"}));
}

#[tokio::test]
async fn interrupt_after_halts_then_resumes() {
    let (graph, runs) = fixtures::counter_graph();
    let app = App::new(graph).with_checkpointer(saver());
    let config = RunConfig::for_thread("after")
        .with_interrupt_after(InterruptNodes::Nodes(vec!["inc".into()]));

    let halted = app
        .invoke(json!({"count": 0}), config.clone())
        .await
        .expect("invoke");
    assert!(matches!(halted.status, RunStatus::Interrupted(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let resumed = app
        .invoke(GraphInput::Empty, config)
        .await
        .expect("resume");
    assert_eq!(resumed.status, RunStatus::Done);
    assert_eq!(resumed.values, json!({"count": 1}));
    assert_eq!(runs.load(Ordering::SeqCst), 1, "completed step is not re-run");
}
