use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{Value, json};

use stepweave::channels::{
    BinaryOperatorAggregate, Channel, ChannelError, Concat, EphemeralValue, LastValue,
    NamedBarrierValue, NamedBarrierValueAfterFinish, Sum, Topic, check_compatible,
};
use stepweave::graph::{GraphSpec, GraphValidationError, NodeSpec};

mod common;
use common::nodes::WriteNode;

/********************
 * Conflict rule
 ********************/

fn noop_node() -> Arc<WriteNode> {
    Arc::new(WriteNode { writes: vec![] })
}

#[test]
fn conflicting_channel_declarations_fail_compilation() {
    let result = GraphSpec::new(
        vec![NodeSpec::new("n", noop_node()).with_channels(["xs"])],
        vec![
            ("xs".to_string(), Box::new(Topic::new(false))),
            ("xs".to_string(), Box::new(Topic::new(true))),
        ],
        vec![],
        vec![],
    );
    assert!(matches!(
        result,
        Err(GraphValidationError::ConflictingChannel { .. })
    ));
}

#[test]
fn last_value_coexists_as_read_only_view() {
    let result = GraphSpec::new(
        vec![NodeSpec::new("n", noop_node()).with_channels(["xs"])],
        vec![
            ("xs".to_string(), Box::new(LastValue::new())),
            (
                "xs".to_string(),
                Box::new(BinaryOperatorAggregate::new(
                    Arc::new(Concat),
                    Some(json!([])),
                )),
            ),
        ],
        vec![],
        vec![],
    );
    let graph = result.expect("LastValue view must be compatible");
    // The owning declaration wins over the read-only view.
    let proto = &graph.channel_prototypes()["xs"];
    let concat = BinaryOperatorAggregate::new(Arc::new(Concat), Some(json!([])));
    assert!(check_compatible(proto.as_ref(), &concat));
}

#[test]
fn reserved_channel_names_are_rejected() {
    let result = GraphSpec::new(
        vec![],
        vec![(
            "__interrupt__".to_string(),
            Box::new(LastValue::new()),
        )],
        vec![],
        vec![],
    );
    assert!(matches!(
        result,
        Err(GraphValidationError::InvalidName { .. })
    ));
}

/********************
 * Empty vs null
 ********************/

#[test]
fn empty_channel_is_distinguishable_from_null_value() {
    let mut ch = LastValue::new();
    let err = ch.get().expect_err("unwritten channel is empty");
    assert!(matches!(err, ChannelError::EmptyChannel));

    ch.update(vec![Value::Null]).expect("null is a value");
    assert_eq!(ch.get().expect("null stored"), Value::Null);
}

/********************
 * Barrier lifecycle across snapshots
 ********************/

#[test]
fn after_finish_barrier_is_sticky_across_restore() {
    let mut barrier = NamedBarrierValueAfterFinish::new(["a", "b"]);
    barrier.update(vec![json!("a")]).expect("member write");

    // Simulate an interrupt boundary: snapshot, drop, restore.
    let snapshot = barrier.checkpoint();
    let mut restored = barrier.from_snapshot(snapshot).expect("restore");
    assert!(restored.get().is_err());

    restored.update(vec![json!("b")]).expect("member write");
    assert!(restored.get().is_err(), "not readable before finish");
    assert!(restored.finish());
    assert_eq!(restored.get().expect("open"), Value::Null);
}

#[test]
fn plain_barrier_rearms_after_consume() {
    let mut barrier = NamedBarrierValue::new(["x"]);
    barrier.update(vec![json!("x")]).expect("write");
    assert!(barrier.get().is_ok());
    assert!(barrier.consume());
    assert!(barrier.get().is_err());
    barrier.update(vec![json!("x")]).expect("write again");
    assert!(barrier.get().is_ok());
}

/********************
 * Snapshot/restore laws
 ********************/

fn json_ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| json!(v)).collect()
}

proptest! {
    #[test]
    fn topic_restore_is_identity(items in proptest::collection::vec(any::<i64>(), 0..24)) {
        let mut topic = Topic::new(true);
        if !items.is_empty() {
            topic.update(json_ints(&items)).expect("update");
        }
        let restored = topic.from_snapshot(topic.checkpoint()).expect("restore");
        prop_assert_eq!(restored.get().expect("get"), topic.get().expect("get"));
        prop_assert!(restored.equals(&topic));
    }

    #[test]
    fn sum_restore_is_identity(items in proptest::collection::vec(any::<i32>(), 1..24)) {
        let mut sum = BinaryOperatorAggregate::new(Arc::new(Sum), Some(json!(0)));
        sum.update(items.iter().map(|v| json!(v)).collect()).expect("update");
        let restored = sum.from_snapshot(sum.checkpoint()).expect("restore");
        prop_assert_eq!(restored.get().expect("get"), sum.get().expect("get"));
    }

    #[test]
    fn sum_reduction_is_batch_insensitive(
        items in proptest::collection::vec(any::<i32>(), 1..24),
        split in any::<usize>(),
    ) {
        // Applying one batch or two must agree: reducers see every write
        // up through the step, never a partial view.
        let mut whole = BinaryOperatorAggregate::new(Arc::new(Sum), Some(json!(0)));
        whole.update(items.iter().map(|v| json!(v)).collect()).expect("update");

        let cut = split % items.len();
        let (left, right) = items.split_at(cut);
        let mut parts = BinaryOperatorAggregate::new(Arc::new(Sum), Some(json!(0)));
        if !left.is_empty() {
            parts.update(left.iter().map(|v| json!(v)).collect()).expect("update");
        }
        if !right.is_empty() {
            parts.update(right.iter().map(|v| json!(v)).collect()).expect("update");
        }
        prop_assert_eq!(whole.get().expect("get"), parts.get().expect("get"));
    }

    #[test]
    fn ephemeral_restore_then_consume(value in any::<i64>()) {
        let mut ch = EphemeralValue::new();
        ch.update(vec![json!(value)]).expect("update");
        let mut restored = ch.from_snapshot(ch.checkpoint()).expect("restore");
        prop_assert_eq!(restored.get().expect("get"), json!(value));
        prop_assert!(restored.consume());
        prop_assert!(restored.get().is_err());
    }
}
