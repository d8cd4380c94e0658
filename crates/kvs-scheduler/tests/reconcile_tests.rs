//! Ordering and state tests of northbound transactions

use kvs_scheduler::test_harness::{Bridge, Leaf};
use kvs_scheduler::{new_value, TxnOperation, TxnOptions, ValueState};
use kvs_test_utils::{
    bridge, bridge_with_mtu, bridge_with_stp, leaf, log_position, Fixture, UplinkDescriptor,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn test_bridge_created_before_leaves() {
    let fx = Fixture::new();
    let (l1, l1_value) = leaf("l1", "br0");
    let (l2, l2_value) = leaf("l2", "br0");
    let (br0, br0_value) = bridge("br0");

    fx.scheduler
        .start_nb_transaction()
        .set_value(l1.clone(), l1_value)
        .set_value(l2.clone(), l2_value)
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    let log = fx.southbound.log();
    assert_eq!(log.len(), 3);
    assert!(log_position(&log, "create bridge/br0") < log_position(&log, "create leaf/l1"));
    assert!(log_position(&log, "create bridge/br0") < log_position(&log, "create leaf/l2"));
    for key in [&br0, &l1, &l2] {
        assert_eq!(fx.state(key), ValueState::Configured);
    }
}

#[tokio::test]
async fn test_leaves_removed_before_bridge() {
    let fx = Fixture::new();
    let (l1, l1_value) = leaf("l1", "br0");
    let (br0, br0_value) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    fx.southbound.clear_log();

    fx.scheduler
        .start_nb_transaction()
        .delete_value(br0.clone())
        .delete_value(l1.clone())
        .commit(TxnOptions::new())
        .await
        .unwrap();

    assert_eq!(fx.southbound.log(), ["remove leaf/l1", "remove bridge/br0"]);
    assert!(fx.southbound.keys().is_empty());
    assert_eq!(fx.state(&br0), ValueState::NonExistent);
    assert_eq!(fx.state(&l1), ValueState::NonExistent);
}

#[tokio::test]
async fn test_leaf_pending_until_bridge_exists() {
    let fx = Fixture::new();
    let (l1, l1_value) = leaf("l1", "br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    let status = fx.scheduler.value_status(&l1).value;
    assert_eq!(status.state, ValueState::Pending);
    assert_eq!(status.details, ["bridge"]);
    assert!(fx.southbound.log().is_empty());

    let (br0, br0_value) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0, br0_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.state(&l1), ValueState::Configured);
    assert_eq!(fx.southbound.log(), ["create bridge/br0", "create leaf/l1"]);
}

#[tokio::test]
async fn test_removing_bridge_makes_leaf_pending() {
    let fx = Fixture::new();
    let (l1, l1_value) = leaf("l1", "br0");
    let (br0, br0_value) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    fx.scheduler
        .start_nb_transaction()
        .delete_value(br0)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    assert!(fx.southbound.keys().is_empty());
    let status = fx.scheduler.value_status(&l1).value;
    assert_eq!(status.state, ValueState::Pending);
    assert_eq!(status.last_operation, TxnOperation::Delete);
}

#[tokio::test]
async fn test_moving_leaf_recreates_it() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    let (br1, br1_value) = bridge("br1");
    let (l1, l1_value) = leaf("l1", "br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0, br0_value)
        .set_value(br1, br1_value)
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    fx.southbound.clear_log();

    let (_, moved) = leaf("l1", "br1");
    let seq = fx
        .scheduler
        .start_nb_transaction()
        .set_value(l1.clone(), moved)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    assert_eq!(fx.southbound.log(), ["remove leaf/l1", "create leaf/l1"]);
    let applied = fx.southbound.get(&l1).unwrap();
    assert!(applied.equals(&Leaf::new("l1", "br1")));

    let txn = fx.scheduler.recorded_transaction(seq).unwrap();
    assert_eq!(txn.executed.len(), 2);
    assert!(txn.executed.iter().all(|op| op.is_recreate));
    assert_eq!(txn.executed[0].operation, TxnOperation::Delete);
    assert_eq!(txn.executed[1].operation, TxnOperation::Add);
}

#[tokio::test]
async fn test_recreating_bridge_takes_leaves_along() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    let (l1, l1_value) = leaf("l1", "br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    fx.southbound.clear_log();

    // Toggling spanning tree cannot be done in place
    let (_, with_stp) = bridge_with_stp("br0");
    let seq = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), with_stp)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    assert_eq!(
        fx.southbound.log(),
        ["remove leaf/l1", "remove bridge/br0", "create bridge/br0", "create leaf/l1"]
    );
    assert_eq!(fx.state(&br0), ValueState::Configured);
    assert_eq!(fx.state(&l1), ValueState::Configured);
    assert_eq!(fx.state("stp/br0"), ValueState::Configured);
    let applied = fx.southbound.get(&br0).unwrap();
    assert!(applied.equals(&Bridge {
        stp: true,
        ..Bridge::new("br0")
    }));

    let txn = fx.scheduler.recorded_transaction(seq).unwrap();
    let leaf_ops: Vec<_> = txn
        .executed
        .iter()
        .filter(|op| op.key == l1)
        .map(|op| (op.operation, op.new_state, op.is_recreate))
        .collect();
    assert_eq!(
        leaf_ops,
        [
            (TxnOperation::Delete, ValueState::Pending, true),
            (TxnOperation::Add, ValueState::Configured, true),
        ]
    );
}

#[tokio::test]
async fn test_modify_in_place_and_equivalent_noop() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    let (_, jumbo) = bridge_with_mtu("br0", 9000);
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), Arc::clone(&jumbo))
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.southbound.log(), ["create bridge/br0", "update bridge/br0"]);

    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), new_value(Bridge {
            mtu: 9000,
            ..Bridge::new("br0")
        }))
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.southbound.log().len(), 2);
    assert_eq!(fx.scheduler.value_status(&br0).value.last_operation, TxnOperation::Modify);
}

#[tokio::test]
async fn test_derived_value_follows_base() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge_with_stp("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    let status = fx.scheduler.value_status(&br0);
    assert_eq!(status.derived.len(), 1);
    assert_eq!(status.derived[0].key, "stp/br0");
    assert_eq!(status.derived[0].state, ValueState::Configured);

    let (_, plain) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), plain)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert!(fx.scheduler.value_status(&br0).derived.is_empty());
    assert_eq!(fx.state("stp/br0"), ValueState::NonExistent);
}

#[tokio::test]
async fn test_invalid_value_reported_and_never_applied() {
    let fx = Fixture::new();
    let (br0, bad) = bridge_with_mtu("br0", 100);
    let err = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), bad)
        .commit(TxnOptions::new())
        .await
        .unwrap_err();

    let kv = err.error_for(&br0).unwrap();
    assert_eq!(kv.operation, TxnOperation::Add);
    let status = fx.scheduler.value_status(&br0).value;
    assert_eq!(status.state, ValueState::Invalid);
    assert_eq!(status.details, ["mtu"]);
    assert!(fx.southbound.log().is_empty());

    // Fixing the value clears the error
    let (_, good) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), good)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    let status = fx.scheduler.value_status(&br0).value;
    assert_eq!(status.state, ValueState::Configured);
    assert_eq!(status.error, None);
}

#[tokio::test]
async fn test_value_without_descriptor_is_unimplemented() {
    let fx = Fixture::new();
    fx.scheduler
        .start_nb_transaction()
        .set_value("route/default", new_value("10.0.0.1".to_string()))
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.state("route/default"), ValueState::Unimplemented);
}

#[tokio::test]
async fn test_any_of_dependency() {
    let fx = Fixture::new();
    fx.scheduler
        .register_descriptor(Arc::new(UplinkDescriptor))
        .unwrap();
    fx.scheduler
        .start_nb_transaction()
        .set_value("uplink/u0", new_value(0u32))
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.state("uplink/u0"), ValueState::Pending);

    let (br7, br7_value) = bridge("br7");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br7, br7_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.state("uplink/u0"), ValueState::Configured);
}

#[tokio::test]
async fn test_last_write_wins_within_transaction() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    let txn = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .delete_value(br0.clone());
    assert_eq!(txn.len(), 1);
    txn.commit(TxnOptions::new()).await.unwrap();
    assert!(fx.southbound.log().is_empty());
    assert_eq!(fx.state(&br0), ValueState::NonExistent);
}
