//! Failure handling: retries, permanent failures and revert

use kvs_scheduler::{DumpView, RetryPolicy, TxnOperation, TxnOptions, TxnType, ValueState};
use kvs_test_utils::{bridge, leaf, Fixture, SouthboundError};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    let (l1, l1_value) = leaf("l1", "br0");
    fx.southbound.fail_next(&br0, 1);

    let err = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap_err();
    let failure = err.error_for(&br0).unwrap();
    assert!(failure.error.downcast_ref::<SouthboundError>().is_some());
    assert_eq!(fx.state(&br0), ValueState::Retrying);
    assert_eq!(fx.state(&l1), ValueState::Pending);

    assert!(fx.wait_for_state(&l1, ValueState::Configured, TIMEOUT).await);
    assert_eq!(fx.state(&br0), ValueState::Configured);
    assert_eq!(fx.scheduler.value_status(&br0).value.error, None);

    let retries: Vec<_> = fx
        .scheduler
        .transaction_history(None, None)
        .into_iter()
        .filter(|txn| txn.txn_type == TxnType::RetryFailedOps)
        .collect();
    assert_eq!(retries.len(), 1);
    assert!(retries[0].executed.iter().any(|op| op.key == br0 && op.is_retry));
}

#[tokio::test]
async fn test_retries_give_up_after_max_attempts() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    fx.southbound.fail_next(&br0, 10);

    let _ = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new())
        .await;

    assert!(fx.wait_for_state(&br0, ValueState::Failed, TIMEOUT).await);
    let creates = fx
        .southbound
        .log()
        .iter()
        .filter(|entry| *entry == "create bridge/br0")
        .count();
    assert_eq!(creates, 3);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    fx.southbound.fail_permanently(&br0);

    let err = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value.clone())
        .commit(TxnOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kv_errors.len(), 1);
    let status = fx.scheduler.value_status(&br0).value;
    assert_eq!(status.state, ValueState::Failed);
    assert_eq!(status.last_operation, TxnOperation::Add);
    assert!(status.error.unwrap().contains("permanent failure"));

    // Unrelated transactions leave the failed value alone
    let (br1, br1_value) = bridge("br1");
    fx.scheduler
        .start_nb_transaction()
        .set_value(br1, br1_value)
        .commit(TxnOptions::new())
        .await
        .unwrap();
    assert_eq!(fx.southbound.log(), ["create bridge/br0", "create bridge/br1"]);

    // Committing it again is an explicit request to re-attempt
    let _ = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new())
        .await;
    assert_eq!(fx.southbound.log().len(), 3);
    assert_eq!(fx.state(&br0), ValueState::Failed);
}

#[tokio::test]
async fn test_retry_disabled_per_transaction() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    fx.southbound.fail_next(&br0, 1);

    let _ = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .commit(TxnOptions::new().with_retry(RetryPolicy::Disabled))
        .await;
    assert_eq!(fx.state(&br0), ValueState::Failed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.scheduler.transaction_barrier().await.unwrap();
    assert_eq!(fx.state(&br0), ValueState::Failed);
}

#[tokio::test]
async fn test_revert_on_failure() {
    let fx = Fixture::new();
    let (br0, br0_value) = bridge("br0");
    let (l1, l1_value) = leaf("l1", "br0");
    fx.southbound.fail_permanently(&l1);

    let err = fx
        .scheduler
        .start_nb_transaction()
        .set_value(br0.clone(), br0_value)
        .set_value(l1.clone(), l1_value)
        .commit(TxnOptions::new().with_revert())
        .await
        .unwrap_err();
    assert!(err.error_for(&l1).is_some());

    assert!(fx.southbound.keys().is_empty());
    assert_eq!(
        fx.southbound.log(),
        ["create bridge/br0", "create leaf/l1", "remove bridge/br0"]
    );
    assert!(fx
        .scheduler
        .dump_values_by_descriptor("bridge", DumpView::Northbound)
        .unwrap()
        .is_empty());

    let txn = fx.scheduler.recorded_transaction(err.seq_num.unwrap()).unwrap();
    assert!(txn.executed.iter().any(|op| op.is_revert && op.key == br0));
}
