//! Property tests: any workload converges with dependencies respected

use kvs_scheduler::{TxnOptions, ValueState};
use kvs_test_utils::{bridge, leaf, Fixture};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Leaf attachments: leaf i is attached to bridge `attachments[i]`
fn workload() -> impl Strategy<Value = (BTreeSet<u8>, Vec<u8>, Vec<bool>)> {
    (
        prop::collection::btree_set(0u8..6, 0..6),
        prop::collection::vec(0u8..6, 0..12),
        prop::collection::vec(any::<bool>(), 6),
    )
}

fn run(bridges: &BTreeSet<u8>, attachments: &[u8], removed: &[bool]) -> Result<(), TestCaseError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let fx = Fixture::new();

        // Leaves first so that the scheduler has to reorder
        let mut txn = fx.scheduler.start_nb_transaction();
        for (i, bridge_idx) in attachments.iter().enumerate() {
            let (key, value) = leaf(&format!("l{i}"), &format!("br{bridge_idx}"));
            txn = txn.set_value(key, value);
        }
        for idx in bridges {
            let (key, value) = bridge(&format!("br{idx}"));
            txn = txn.set_value(key, value);
        }
        txn.commit(TxnOptions::new()).await.unwrap();

        let mut txn = fx.scheduler.start_nb_transaction();
        let mut remaining = bridges.clone();
        for idx in bridges {
            if removed[usize::from(*idx)] {
                txn = txn.delete_value(format!("bridge/br{idx}"));
                remaining.remove(idx);
            }
        }
        txn.commit(TxnOptions::new()).await.unwrap();

        let log = fx.southbound.log();
        for (i, bridge_idx) in attachments.iter().enumerate() {
            let key = format!("leaf/l{i}");
            let bridge_key = format!("bridge/br{bridge_idx}");
            let create_leaf = log.iter().position(|e| *e == format!("create {key}"));
            let create_bridge = log.iter().position(|e| *e == format!("create {bridge_key}"));
            if let Some(create_leaf) = create_leaf {
                prop_assert!(create_bridge.is_some_and(|b| b < create_leaf), "{log:?}");
            }
            let remove_bridge = log.iter().rposition(|e| *e == format!("remove {bridge_key}"));
            let remove_leaf = log.iter().rposition(|e| *e == format!("remove {key}"));
            if let Some(remove_bridge) = remove_bridge {
                prop_assert!(remove_leaf.is_some_and(|l| l < remove_bridge), "{log:?}");
            }

            let expected = if remaining.contains(bridge_idx) {
                ValueState::Configured
            } else {
                ValueState::Pending
            };
            prop_assert_eq!(fx.state(&key), expected);
            prop_assert_eq!(fx.southbound.contains(&key), remaining.contains(bridge_idx));
        }
        fx.scheduler.close().await;
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_dependencies_respected((bridges, attachments, removed) in workload()) {
        run(&bridges, &attachments, &removed)?;
    }
}
