//! Seeded reconciliation simulator
//!
//! Drives a scheduler over the in-memory southbound through a random
//! workload: bulk create with injected failures, partial deletion, drift
//! behind the scheduler's back and a downstream resync. At the end every
//! desired value must be either applied or pending on a missing bridge,
//! and the southbound must hold nothing else than what was requested or
//! created externally.

use super::southbound::{
    bridge_key, leaf_key, Bridge, BridgeDescriptor, Leaf, LeafDescriptor, MemorySouthbound,
};
use crate::api::{new_value, value_as, Value, ValueState};
use crate::config::{RetryOpt, SchedulerConfig};
use crate::scheduler::KvScheduler;
use crate::txn::{ResyncType, TxnOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Key of the bridge created outside of the scheduler
const EXTERNAL_BRIDGE: &str = "ext0";

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// RNG seed
    pub seed: u64,
    /// Number of bridges
    pub bridges: usize,
    /// Number of leaves
    pub leaves: usize,
    /// Probability that an operation on a key fails once
    pub failure_rate: f64,
    /// Probability that a value is deleted in the second phase
    pub delete_ratio: f64,
    /// Probability that a leaf references a bridge which is never created
    pub orphan_rate: f64,
    /// Scheduler under test
    pub scheduler: SchedulerConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            bridges: 8,
            leaves: 32,
            failure_rate: 0.1,
            delete_ratio: 0.2,
            orphan_rate: 0.05,
            scheduler: SchedulerConfig::new()
                .with_retry(RetryOpt::new(Duration::from_millis(10), 5, false)),
        }
    }
}

/// Simulator statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    /// Northbound transactions committed
    pub transactions: u64,
    /// Transactions reporting at least one failed operation
    pub transactions_with_errors: u64,
    /// Failures injected into the southbound
    pub injected_failures: u64,
    /// Values removed from the southbound behind the scheduler's back
    pub drifted_values: u64,
    /// Values configured at the end
    pub configured: usize,
    /// Values pending at the end
    pub pending: usize,
    /// Recorded transactions at the end
    pub recorded_transactions: usize,
}

/// Simulator report
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Configuration the run used
    pub config: SimulatorConfig,
    /// Statistics
    pub stats: SimulatorStats,
    /// Detected inconsistencies
    pub violations: Vec<String>,
}

impl SimulatorReport {
    /// True if the run converged without inconsistencies
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();

        report.push_str("=== KV Scheduler Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!("Bridges: {}\n", self.config.bridges));
        report.push_str(&format!("Leaves: {}\n", self.config.leaves));
        report.push_str(&format!("Transactions: {}\n", self.stats.transactions));
        report.push_str(&format!(
            "Transactions With Errors: {}\n",
            self.stats.transactions_with_errors
        ));
        report.push_str(&format!("Injected Failures: {}\n", self.stats.injected_failures));
        report.push_str(&format!("Drifted Values: {}\n", self.stats.drifted_values));
        report.push_str(&format!("Configured: {}\n", self.stats.configured));
        report.push_str(&format!("Pending: {}\n", self.stats.pending));
        report.push_str(&format!(
            "Recorded Transactions: {}\n",
            self.stats.recorded_transactions
        ));
        report.push_str(&format!("Violations: {}\n", self.violations.len()));

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                report.push_str(&format!("{}. {v}\n", i + 1));
            }
        }

        report.push_str(&format!(
            "\n=== Result: {} ===\n",
            if self.passed() { "PASS" } else { "FAIL" }
        ));

        report
    }
}

/// Run the reconciliation simulator
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();

    let southbound = MemorySouthbound::new();
    let scheduler = KvScheduler::new(config.scheduler.clone());
    for descriptor in [
        BridgeDescriptor::new(Arc::clone(&southbound)) as Arc<dyn crate::KvDescriptor>,
        LeafDescriptor::new(Arc::clone(&southbound)),
    ] {
        if let Err(err) = scheduler.register_descriptor(descriptor) {
            violations.push(format!("descriptor registration failed: {err}"));
        }
    }

    let mut desired = generate_values(&config, &mut rng);
    info!(seed = config.seed, values = desired.len(), "Simulation started");

    // Phase 1: bulk create with transient failures
    stats.injected_failures += inject_failures(&southbound, desired.keys(), config.failure_rate, &mut rng);
    let mut txn = scheduler.start_nb_transaction();
    for (key, value) in &desired {
        txn = txn.set_value(key.clone(), Arc::clone(value));
    }
    commit(txn, TxnOptions::new().with_description("create"), &mut stats).await;
    wait_for_retries(&scheduler, &southbound, &desired).await;

    // Phase 2: partial deletion
    let deleted: Vec<String> = desired
        .keys()
        .filter(|_| rng.random_bool(config.delete_ratio.clamp(0.0, 1.0)))
        .cloned()
        .collect();
    stats.injected_failures += inject_failures(&southbound, deleted.iter(), config.failure_rate, &mut rng);
    let mut txn = scheduler.start_nb_transaction();
    for key in &deleted {
        desired.remove(key);
        txn = txn.delete_value(key.clone());
    }
    commit(txn, TxnOptions::new().with_description("delete"), &mut stats).await;
    wait_for_retries(&scheduler, &southbound, &desired).await;

    // Phase 3: drift and downstream resync
    southbound.insert_external(&bridge_key(EXTERNAL_BRIDGE), new_value(Bridge::new(EXTERNAL_BRIDGE)));
    let drifted: Vec<String> = desired
        .keys()
        .filter(|key| key.starts_with(super::southbound::LEAF_PREFIX))
        .filter(|_| rng.random_bool(0.25))
        .cloned()
        .collect();
    for key in &drifted {
        if southbound.remove_external(key) {
            stats.drifted_values += 1;
        }
    }
    commit(
        scheduler.start_nb_transaction(),
        TxnOptions::new()
            .with_resync(ResyncType::Downstream)
            .with_description("downstream resync"),
        &mut stats,
    )
    .await;
    wait_for_retries(&scheduler, &southbound, &desired).await;

    check_convergence(&scheduler, &southbound, &desired, &mut stats, &mut violations);
    stats.recorded_transactions = scheduler.transaction_history(None, None).len();
    scheduler.close().await;

    info!(violations = violations.len(), "Simulation finished");
    SimulatorReport {
        config,
        stats,
        violations,
    }
}

fn generate_values(config: &SimulatorConfig, rng: &mut StdRng) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    for i in 0..config.bridges {
        let name = format!("br{i}");
        let bridge = Bridge {
            mtu: if rng.random_bool(0.5) { 1500 } else { 9000 },
            stp: rng.random_bool(0.3),
            ..Bridge::new(&name)
        };
        values.insert(bridge_key(&name), new_value(bridge));
    }
    for i in 0..config.leaves {
        let name = format!("lf{i}");
        let bridge = if config.bridges == 0 || rng.random_bool(config.orphan_rate.clamp(0.0, 1.0)) {
            "missing".to_owned()
        } else {
            format!("br{}", rng.random_range(0..config.bridges))
        };
        let leaf = Leaf {
            vlan: rng.random_range(1..4095),
            ..Leaf::new(&name, &bridge)
        };
        values.insert(leaf_key(&name), new_value(leaf));
    }
    values
}

fn inject_failures<'a>(
    southbound: &MemorySouthbound,
    keys: impl Iterator<Item = &'a String>,
    rate: f64,
    rng: &mut StdRng,
) -> u64 {
    let mut injected = 0;
    for key in keys {
        if rng.random_bool(rate.clamp(0.0, 1.0)) {
            southbound.fail_next(key, 1);
            injected += 1;
        }
    }
    injected
}

async fn commit(txn: crate::Txn, opts: TxnOptions, stats: &mut SimulatorStats) {
    stats.transactions += 1;
    if let Err(err) = txn.commit(opts).await {
        debug!(error = %err, "Transaction reported failures");
        stats.transactions_with_errors += 1;
    }
}

/// Wait until no desired or applied value awaits a retry
async fn wait_for_retries(
    scheduler: &KvScheduler,
    southbound: &MemorySouthbound,
    desired: &BTreeMap<String, Value>,
) {
    let period = Duration::from_millis(scheduler.config().retry.period_ms.max(1));
    for _ in 0..200 {
        if scheduler.transaction_barrier().await.is_err() {
            return;
        }
        let retrying = desired
            .keys()
            .cloned()
            .chain(southbound.keys())
            .any(|key| scheduler.value_status(&key).value.state == ValueState::Retrying);
        if !retrying {
            return;
        }
        tokio::time::sleep(period).await;
    }
}

fn check_convergence(
    scheduler: &KvScheduler,
    southbound: &MemorySouthbound,
    desired: &BTreeMap<String, Value>,
    stats: &mut SimulatorStats,
    violations: &mut Vec<String>,
) {
    for (key, value) in desired {
        let state = scheduler.value_status(key).value.state;
        let orphan = value_as::<Leaf>(value)
            .is_some_and(|leaf| !desired.contains_key(&bridge_key(&leaf.bridge)));
        match (state, orphan) {
            (ValueState::Configured, false) => {
                stats.configured += 1;
                match southbound.get(key) {
                    Some(applied) if applied.equals(value.as_ref()) => {}
                    Some(_) => violations.push(format!("{key}: southbound holds a stale value")),
                    None => violations.push(format!("{key}: configured but missing in southbound")),
                }
            }
            (ValueState::Pending, true) => {
                stats.pending += 1;
                if southbound.contains(key) {
                    violations.push(format!("{key}: pending but present in southbound"));
                }
            }
            (state, _) => violations.push(format!("{key}: unexpected state {state}")),
        }
    }

    let external = bridge_key(EXTERNAL_BRIDGE);
    for key in southbound.keys() {
        if key != external && !desired.contains_key(&key) {
            violations.push(format!("{key}: left over in southbound"));
        }
    }
    let external_state = scheduler.value_status(&external).value.state;
    if external_state != ValueState::Retrieved {
        violations.push(format!("{external}: expected RETRIEVED, got {external_state}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulator_converges_without_failures() {
        let config = SimulatorConfig {
            failure_rate: 0.0,
            ..SimulatorConfig::default()
        };
        let report = run_simulator(config).await;
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.injected_failures, 0);
        assert_eq!(report.stats.transactions, 3);
    }

    #[tokio::test]
    async fn simulator_converges_with_failures() {
        let report = run_simulator(SimulatorConfig::default()).await;
        assert!(report.passed(), "{}", report.generate_text());
        assert!(report.generate_text().contains("=== Result: PASS ==="));
    }
}
