//! Testing utilities for the KV scheduler workspace
//!
//! Shared fixtures: a scheduler wired to the in-memory southbound with the
//! bridge and leaf descriptors, value constructors and polling helpers.

#![allow(missing_docs)]

use kvs_scheduler::test_harness::{
    bridge_key, leaf_key, Bridge, BridgeDescriptor, Leaf, LeafDescriptor, MemorySouthbound,
};
use kvs_scheduler::{
    new_value, prefix_selector, Dependency, KvDescriptor, KvScheduler, RetryOpt, SchedulerConfig,
    Value, ValueState,
};
use std::sync::{Arc, Once};
use std::time::Duration;

pub use kvs_scheduler::test_harness::{SbIndex, SouthboundError};

static TRACING: Once = Once::new();

/// Install a test log subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with short retry delays
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::new().with_retry(RetryOpt::new(Duration::from_millis(10), 3, false))
}

pub struct Fixture {
    pub scheduler: KvScheduler,
    pub southbound: Arc<MemorySouthbound>,
}

impl Fixture {
    /// Scheduler with bridge and leaf descriptors registered
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        init_tracing();
        let southbound = MemorySouthbound::new();
        let scheduler = KvScheduler::new(config);
        scheduler
            .register_descriptor(BridgeDescriptor::new(Arc::clone(&southbound)))
            .unwrap();
        scheduler
            .register_descriptor(LeafDescriptor::new(Arc::clone(&southbound)))
            .unwrap();
        Self {
            scheduler,
            southbound,
        }
    }

    pub fn state(&self, key: &str) -> ValueState {
        self.scheduler.value_status(key).value.state
    }

    /// Poll until `key` reaches `state`, returning false on timeout
    pub async fn wait_for_state(&self, key: &str, state: ValueState, timeout: Duration) -> bool {
        wait_for_state(&self.scheduler, key, state, timeout).await
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn wait_for_state(
    scheduler: &KvScheduler,
    key: &str,
    state: ValueState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let _ = scheduler.transaction_barrier().await;
        if scheduler.value_status(key).value.state == state {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn bridge(name: &str) -> (String, Value) {
    (bridge_key(name), new_value(Bridge::new(name)))
}

pub fn bridge_with_mtu(name: &str, mtu: u32) -> (String, Value) {
    (
        bridge_key(name),
        new_value(Bridge {
            mtu,
            ..Bridge::new(name)
        }),
    )
}

pub fn bridge_with_stp(name: &str) -> (String, Value) {
    (
        bridge_key(name),
        new_value(Bridge {
            stp: true,
            ..Bridge::new(name)
        }),
    )
}

pub fn leaf(name: &str, bridge: &str) -> (String, Value) {
    (leaf_key(name), new_value(Leaf::new(name, bridge)))
}

/// Index of `entry` in the southbound log
pub fn log_position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} missing in {log:?}"))
}

/// Descriptor of values needing any bridge to exist; no southbound effects
#[derive(Debug, Default)]
pub struct UplinkDescriptor;

impl KvDescriptor for UplinkDescriptor {
    fn name(&self) -> &str {
        "uplink"
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with("uplink/")
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some("uplink/")
    }

    fn dependencies(&self, _key: &str, _value: &Value) -> Vec<Dependency> {
        vec![Dependency::any_of("any bridge", prefix_selector("bridge/"))]
    }
}
