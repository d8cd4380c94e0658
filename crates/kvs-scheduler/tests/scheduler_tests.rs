//! Scheduler API tests: status watch, history, metadata, dumps and shutdown

use kvs_scheduler::test_harness::{BridgeDescriptor, SbIndex};
use kvs_scheduler::{
    metadata_as, prefix_selector, DumpView, SchedulerError, TxnOperation, TxnOptions, TxnType,
    ValueOrigin, ValueState,
};
use kvs_test_utils::{bridge, leaf, Fixture};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_watch_value_status() {
    let fx = Fixture::new();
    let mut statuses = fx.scheduler.watch_value_status(prefix_selector("bridge/"), 16);

    let (br0, br0_value) = bridge("br0");
    let (l1, l1_value) = leaf("l1", "br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(l1, l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(1), statuses.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.value.key, br0);
    assert_eq!(status.value.state, ValueState::Configured);
    assert_eq!(status.value.last_operation, TxnOperation::Add);
    // Leaves are not selected
    assert!(statuses.try_recv().is_err());

    fx.scheduler
        .start_nb_transaction()
        .delete_value(br0.clone())
        .commit(TxnOptions::new())
        .await
        .unwrap();
    let status = statuses.recv().await.unwrap();
    assert_eq!(status.value.key, br0);
    assert_eq!(status.value.state, ValueState::Removed);
}

#[tokio::test]
async fn test_transaction_history() {
    let fx = Fixture::new();
    let before = chrono::Utc::now();
    let (br0, br0_value) = bridge("br0");
    let first = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new().with_description("add bridge"))
        .await
        .unwrap();
    let second = fx
        .scheduler
        .start_nb_transaction()
        .delete_value(br0.clone())
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert!(second > first);

    let history = fx.scheduler.transaction_history(Some(before), None);
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|txn| txn.txn_type == TxnType::NbTransaction));

    let txn = fx.scheduler.recorded_transaction(first).unwrap();
    assert_eq!(txn.description, "add bridge");
    assert!(txn.succeeded());
    assert_eq!(txn.values.len(), 1);
    assert_eq!(txn.planned.len(), 1);
    let op = &txn.executed[0];
    assert_eq!(op.key, br0);
    assert_eq!(op.operation, TxnOperation::Add);
    assert_eq!(op.prev_state, ValueState::NonExistent);
    assert_eq!(op.new_state, ValueState::Configured);
    assert!(txn.to_string().contains("bridge/br0"));

    assert!(fx
        .scheduler
        .transaction_history(None, Some(before))
        .is_empty());
}

#[tokio::test]
async fn test_metadata_map_mirrors_southbound_index() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();

    let map = fx.scheduler.metadata_map("bridge").unwrap();
    let metadata = map.get("br0").unwrap();
    assert_eq!(metadata_as::<SbIndex>(&metadata), Some(&SbIndex(1)));
    assert_eq!(map.list_names(), ["br0"]);
    assert!(fx.scheduler.metadata_map("leaf").is_none());

    fx.scheduler
        .start_nb_transaction()
        .delete_value(br0)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert!(map.get("br0").is_none());
}

#[tokio::test]
async fn test_dump_views() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    let (br1, br1_value) = bridge("br1");
    fx.southbound.fail_permanently(&br1);
    let _ = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(br1.clone(), br1_value)
        .commit(TxnOptions::new())
        .await;

    let keys = |view| -> Vec<String> {
        fx.scheduler
            .dump_values_by_descriptor("bridge", view)
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect()
    };
    assert_eq!(keys(DumpView::Northbound), [br0.clone(), br1]);
    assert_eq!(keys(DumpView::Cached), [br0.clone()]);
    assert_eq!(keys(DumpView::Southbound), [br0]);

    let cached = fx
        .scheduler
        .dump_values_by_descriptor("bridge", DumpView::Cached)
        .unwrap();
    assert_eq!(cached[0].origin, ValueOrigin::FromNb);

    assert!(matches!(
        fx.scheduler.dump_values_by_descriptor("route", DumpView::Cached),
        Err(SchedulerError::UnknownDescriptor(_))
    ));
    fx.southbound.set_unreachable(true);
    assert!(matches!(
        fx.scheduler.dump_values_by_descriptor("bridge", DumpView::Southbound),
        Err(SchedulerError::DumpFailed { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_descriptor_rejected() {
    let fx = Fixture::new();
    let err = fx
        .scheduler
        .register_descriptor(BridgeDescriptor::new(fx.southbound.clone()))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateDescriptor(name) if name == "bridge"));
    assert_eq!(
        fx.scheduler.registered_nb_key_prefixes(),
        ["bridge/", "leaf/"]
    );
}

#[tokio::test]
async fn test_cancelled_transaction_executes_nothing() {
    let fx = Fixture::new();
    let token = CancellationToken::new();
    token.cancel();
    let (br0, br0_value) = bridge("br0");
    let err = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0, br0_value)
        .commit(TxnOptions::new().with_cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err.txn_init_error, Some(SchedulerError::Cancelled)));
    assert!(fx.southbound.log().is_empty());
}

#[tokio::test]
async fn test_non_blocking_commit_and_barrier() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit_non_blocking(TxnOptions::new())
        .unwrap();
    fx.scheduler.transaction_barrier().await.unwrap();
    assert_eq!(fx.state(&br0), ValueState::Configured);
}

#[tokio::test]
async fn test_closed_scheduler_rejects_work() {
    let fx = Fixture::new();
    fx.scheduler.close().await;
    assert!(fx.scheduler.is_closed());

    let (br0, br0_value) = bridge("br0");
    let err = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0, br0_value)
        .commit(TxnOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err.txn_init_error, Some(SchedulerError::Closed)));
    assert!(matches!(
        fx.scheduler.transaction_barrier().await,
        Err(SchedulerError::Closed)
    ));
    assert!(matches!(
        fx.scheduler.push_sb_notification("bridge/x", None, None),
        Err(SchedulerError::Closed)
    ));
}
