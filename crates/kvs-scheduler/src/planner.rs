//! Planning of a reconciliation pass
//!
//! Expands the desired state with derived values, validates it, finds the
//! values whose dependencies can be satisfied and diffs them against the
//! graph. The resulting operations are ordered deletes first (dependents
//! before their dependencies) and then adds and modifies (dependencies
//! first).

use crate::api::{Dependency, Value, ValueOrigin, ValueState, TxnOperation};
use crate::descriptor::KvDescriptor;
use crate::error::{invalid_fields, KeyWithError};
use crate::graph::Graph;
use crate::registry::DescriptorRegistry;
use crate::txn::RecordedTxnOp;
use kvs_keyset::{topological_order, KeyDeps, KeySet, MapKeySet, SingletonKeySet, SliceKeySet};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keys allowed to re-attempt a value which failed before
#[derive(Debug, Clone)]
pub(crate) enum Forced {
    All,
    Keys(HashSet<String>),
}

impl Forced {
    pub(crate) fn none() -> Self {
        Self::Keys(HashSet::new())
    }

    fn contains(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Keys(keys) => keys.contains(key),
        }
    }
}

/// Operation to execute
#[derive(Debug, Clone)]
pub(crate) struct PlannedOp {
    pub(crate) key: String,
    pub(crate) operation: TxnOperation,
    /// New value for add and modify
    pub(crate) value: Option<Value>,
    /// `None` for derived properties without a descriptor
    pub(crate) descriptor: Option<Arc<dyn KvDescriptor>>,
    pub(crate) derived_from: Option<String>,
    pub(crate) deps: Vec<Dependency>,
    pub(crate) is_recreate: bool,
    /// State taken after a successful delete, with its details
    pub(crate) after_delete: Option<(ValueState, Vec<String>)>,
}

impl PlannedOp {
    pub(crate) fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }
}

/// Outcome of planning
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub(crate) ops: Vec<PlannedOp>,
    /// Values rejected by validation
    pub(crate) errors: Vec<KeyWithError>,
    pub(crate) records: Vec<RecordedTxnOp>,
    /// Keys the desired state accounts for, present or not
    pub(crate) wanted: HashSet<String>,
}

struct Planned {
    value: Value,
    descriptor: Option<Arc<dyn KvDescriptor>>,
    derived_from: Option<String>,
    deps: Vec<Dependency>,
}

struct Planner<'a> {
    registry: &'a DescriptorRegistry,
    graph: &'a mut Graph,
    desired: &'a BTreeMap<String, Value>,
    forced: &'a Forced,
    /// Descriptors whose southbound state is unknown in this pass
    unknown: &'a HashSet<String>,
    planned: BTreeMap<String, Planned>,
    /// Present values kept untouched by this pass
    retained: HashSet<String>,
    after_delete: HashMap<String, (ValueState, Vec<String>)>,
    plan: Plan,
}

/// Plan the reconciliation of `desired` against `graph`.
///
/// Updates the graph with states which need no operation (pending,
/// invalid, unimplemented values and ownership transfers). Values of the
/// `unknown` descriptors are neither added nor removed.
pub(crate) fn plan(
    registry: &DescriptorRegistry,
    graph: &mut Graph,
    desired: &BTreeMap<String, Value>,
    forced: &Forced,
    unknown: &HashSet<String>,
    is_retry: bool,
) -> Plan {
    let mut planner = Planner {
        registry,
        graph,
        desired,
        forced,
        unknown,
        planned: BTreeMap::new(),
        retained: HashSet::new(),
        after_delete: HashMap::new(),
        plan: Plan::default(),
    };
    planner.expand(is_retry);
    let ready = planner.ready_keys();
    let mut deletes = planner.unready_and_removed(&ready);
    let mut updates = Vec::new();
    planner.diff(&ready, &mut deletes, &mut updates);
    planner.plan.ops = order(deletes, true);
    planner.plan.ops.extend(order(updates, false));
    let Planner {
        planned,
        retained,
        mut plan,
        ..
    } = planner;
    plan.wanted.extend(planned.into_keys());
    plan.wanted.extend(retained);
    plan
}

impl Planner<'_> {
    fn expand(&mut self, is_retry: bool) {
        let desired = self.desired;
        for (key, value) in desired {
            let Some(descriptor) = self.registry.for_key(key) else {
                let node = self.graph.node_mut(key);
                if node.state != ValueState::Unimplemented {
                    debug!(key = %key, "No descriptor for value");
                }
                node.state = ValueState::Unimplemented;
                node.origin = ValueOrigin::FromNb;
                node.details.clear();
                self.retained.insert(key.clone());
                continue;
            };
            self.plan_value(key, Arc::clone(value), Some(descriptor), None, is_retry);
        }
    }

    fn plan_value(
        &mut self,
        key: &str,
        value: Value,
        descriptor: Option<Arc<dyn KvDescriptor>>,
        derived_from: Option<&str>,
        is_retry: bool,
    ) {
        if let Some(desc) = &descriptor {
            if derived_from.is_none() && self.unknown.contains(desc.name()) {
                debug!(key = %key, descriptor = %desc.name(), "Southbound state unknown, leaving value as is");
                self.retain_with_derived(key);
                return;
            }
            if self.is_blocked(key, &value, desc.as_ref()) {
                debug!(key = %key, "Skipping value which failed before");
                self.retain_with_derived(key);
                return;
            }
            if let Err(err) = desc.validate(key, &value) {
                self.mark_invalid(key, &value, desc.as_ref(), derived_from, err, is_retry);
                return;
            }
        }

        let (deps, derived) = match &descriptor {
            Some(desc) => (desc.dependencies(key, &value), desc.derived_values(key, &value)),
            None => (Vec::new(), Vec::new()),
        };
        self.planned.insert(
            key.to_owned(),
            Planned {
                value,
                descriptor,
                derived_from: derived_from.map(str::to_owned),
                deps,
            },
        );

        for kv in derived {
            if self.desired.contains_key(&kv.key) || self.planned.contains_key(&kv.key) {
                warn!(key = %kv.key, base = %key, "Derived key collides with another value, skipping");
                continue;
            }
            let desc = self.registry.for_key(&kv.key);
            self.plan_value(&kv.key, kv.value, desc, Some(key), is_retry);
        }
    }

    fn is_blocked(&self, key: &str, value: &Value, descriptor: &dyn KvDescriptor) -> bool {
        if self.forced.contains(key) {
            return false;
        }
        self.graph
            .get(key)
            .and_then(|node| node.failed_value.as_ref())
            .is_some_and(|failed| descriptor.equivalent_values(key, failed, value))
    }

    /// True if the base value of `key` belongs to an unknown descriptor
    fn is_unknown(&self, key: &str) -> bool {
        if self.unknown.is_empty() {
            return false;
        }
        let base = self.graph.base_of(key);
        self.registry
            .for_key(&base)
            .is_some_and(|desc| self.unknown.contains(desc.name()))
    }

    fn retain_with_derived(&mut self, key: &str) {
        self.retained.insert(key.to_owned());
        for derived in self.graph.derived_of(key) {
            self.retain_with_derived(&derived);
        }
    }

    fn mark_invalid(
        &mut self,
        key: &str,
        value: &Value,
        descriptor: &dyn KvDescriptor,
        derived_from: Option<&str>,
        err: anyhow::Error,
        is_retry: bool,
    ) {
        let fields = invalid_fields(&err).unwrap_or_default();
        let err = Arc::new(err);
        warn!(key = %key, error = %err, "Value failed validation");

        let node = self.graph.node_mut(key);
        let operation = if node.is_present() {
            TxnOperation::Modify
        } else {
            TxnOperation::Add
        };
        let prev_state = node.state;
        node.descriptor = Some(descriptor.name().to_owned());
        node.derived_from = derived_from.map(str::to_owned);
        node.error = Some(Arc::clone(&err));
        node.details.clone_from(&fields);
        node.failed_value = Some(Arc::clone(value));
        node.last_op = operation;
        if node.is_present() && node.origin != ValueOrigin::FromSb {
            self.after_delete
                .insert(key.to_owned(), (ValueState::Invalid, fields));
        } else if !node.is_present() {
            node.state = ValueState::Invalid;
        }

        self.plan.records.push(RecordedTxnOp {
            key: key.to_owned(),
            operation,
            prev_value: node.value.as_ref().map(|v| format!("{v:?}")),
            new_value: Some(format!("{value:?}")),
            prev_state,
            new_state: ValueState::Invalid,
            error: Some(err.to_string()),
            is_derived: derived_from.is_some(),
            is_recreate: false,
            is_retry,
            is_revert: false,
        });
        self.plan.errors.push(KeyWithError {
            key: key.to_owned(),
            operation,
            error: err,
        });
        self.plan.wanted.insert(key.to_owned());
    }

    /// Greatest set of planned keys whose dependencies are satisfied by the
    /// set itself or by present values this pass keeps
    fn ready_keys(&self) -> BTreeSet<String> {
        let kept: BTreeSet<String> = self
            .graph
            .present()
            .filter(|node| node.origin == ValueOrigin::FromSb || self.retained.contains(&node.key))
            .map(|node| node.key.clone())
            .collect();

        let mut ready: BTreeSet<String> = self.planned.keys().cloned().collect();
        loop {
            let unready: Vec<String> = ready
                .iter()
                .filter(|key| !self.unmet(key, &ready, &kept).is_empty())
                .cloned()
                .collect();
            if unready.is_empty() {
                return ready;
            }
            for key in unready {
                ready.remove(&key);
            }
        }
    }

    /// Labels of the dependencies of `key` not satisfied by `ready` or `kept`
    fn unmet(&self, key: &str, ready: &BTreeSet<String>, kept: &BTreeSet<String>) -> Vec<String> {
        let Some(planned) = self.planned.get(key) else {
            return Vec::new();
        };
        let available = |k: &str| ready.contains(k) || kept.contains(k);
        let mut unmet = Vec::new();
        if let Some(base) = &planned.derived_from {
            if !ready.contains(base) {
                unmet.push(base.clone());
            }
        }
        for dep in &planned.deps {
            let by_key = dep.key.as_deref().is_some_and(available);
            let by_selector = dep.any_of.is_some()
                && ready
                    .iter()
                    .chain(kept.iter())
                    .any(|k| k != key && dep.is_satisfied_by(k));
            if !by_key && !by_selector {
                unmet.push(dep.label.clone());
            }
        }
        unmet
    }

    /// Mark planned but unready values as pending and collect deletes of
    /// present values no longer wanted
    fn unready_and_removed(&mut self, ready: &BTreeSet<String>) -> Vec<PlannedOp> {
        let kept: BTreeSet<String> = self
            .graph
            .present()
            .filter(|node| node.origin == ValueOrigin::FromSb || self.retained.contains(&node.key))
            .map(|node| node.key.clone())
            .collect();

        let unready: Vec<String> = self
            .planned
            .keys()
            .filter(|key| !ready.contains(*key))
            .cloned()
            .collect();
        for key in unready {
            let details = self.unmet(&key, ready, &kept);
            let Some(planned) = self.planned.get(&key) else {
                continue;
            };
            let descriptor = planned.descriptor.as_ref().map(|d| d.name().to_owned());
            let derived_from = planned.derived_from.clone();
            let node = self.graph.node_mut(&key);
            node.descriptor = descriptor;
            node.derived_from = derived_from;
            if node.is_present() && node.origin != ValueOrigin::FromSb {
                self.after_delete
                    .insert(key.clone(), (ValueState::Pending, details));
            } else if !node.is_present() {
                if node.state != ValueState::Pending {
                    debug!(key = %key, unmet = ?details, "Value is pending");
                }
                node.state = ValueState::Pending;
                node.error = None;
                node.details = details;
            }
        }

        let mut deletes = Vec::new();
        for node in self.graph.present() {
            let wanted = ready.contains(&node.key);
            if wanted
                || self.retained.contains(&node.key)
                || node.origin == ValueOrigin::FromSb
                || (node.descriptor.is_none() && node.derived_from.is_none())
                || self.is_unknown(&node.key)
            {
                continue;
            }
            let delete_failed = node.last_op == TxnOperation::Delete
                && matches!(node.state, ValueState::Failed | ValueState::Retrying);
            if delete_failed && !self.forced.contains(&node.key) {
                continue;
            }
            deletes.push(PlannedOp {
                key: node.key.clone(),
                operation: TxnOperation::Delete,
                value: None,
                descriptor: node.descriptor.as_deref().and_then(|d| self.registry.get(d)),
                derived_from: node.derived_from.clone(),
                deps: node.deps.clone(),
                is_recreate: false,
                after_delete: self.after_delete.remove(&node.key),
            });
        }
        deletes
    }

    fn diff(&mut self, ready: &BTreeSet<String>, deletes: &mut Vec<PlannedOp>, updates: &mut Vec<PlannedOp>) {
        let mut changes = Vec::new();
        for key in ready {
            let Some(planned) = self.planned.get(key) else {
                continue;
            };
            let node = self.graph.node_mut(key);
            node.descriptor = planned.descriptor.as_ref().map(|d| d.name().to_owned());
            node.derived_from.clone_from(&planned.derived_from);

            let Some(old) = &node.value else {
                changes.push((key, Change::Add));
                continue;
            };
            let equivalent = match &planned.descriptor {
                Some(desc) => desc.equivalent_values(key, old, &planned.value),
                None => old.equals(planned.value.as_ref()),
            };
            if equivalent {
                if node.origin == ValueOrigin::FromSb {
                    debug!(key = %key, "Taking ownership of value found in southbound");
                }
                node.origin = ValueOrigin::FromNb;
                node.state = ValueState::Configured;
                node.details.clear();
                node.deps.clone_from(&planned.deps);
                node.clear_failure();
                changes.push((key, Change::Unchanged));
                continue;
            }
            let recreate = planned.descriptor.as_ref().is_some_and(|desc| {
                desc.modify_with_recreate(key, old, &planned.value, node.metadata.as_ref())
            });
            changes.push((key, if recreate { Change::Recreate } else { Change::Modify }));
        }

        let recreated: BTreeSet<String> = changes
            .iter()
            .filter(|(_, change)| *change == Change::Recreate)
            .map(|(key, _)| (*key).clone())
            .collect();
        let mut dependents = self.recreate_dependents(recreated, ready);

        for (key, change) in changes {
            let Some(planned) = self.planned.get(key) else {
                continue;
            };
            let after_delete = dependents
                .remove(key)
                .map(|labels| (ValueState::Pending, labels));
            if after_delete.is_some() {
                debug!(key = %key, "Recreating value together with its dependency");
            }
            if after_delete.is_some() || change == Change::Recreate {
                let mut delete = planned_op(key, planned, TxnOperation::Delete, true);
                delete.value = None;
                delete.deps = self.graph.get(key).map(|node| node.deps.clone()).unwrap_or_default();
                delete.after_delete = after_delete;
                deletes.push(delete);
                updates.push(planned_op(key, planned, TxnOperation::Add, true));
                continue;
            }
            match change {
                Change::Add => updates.push(planned_op(key, planned, TxnOperation::Add, false)),
                Change::Modify => updates.push(planned_op(key, planned, TxnOperation::Modify, false)),
                Change::Unchanged | Change::Recreate => {}
            }
        }
    }

    /// Present values of this pass which use a recreated value, directly or
    /// through other such values, with the labels of the dependencies
    /// going away. They are removed before and added back after it.
    fn recreate_dependents(
        &self,
        mut removed: BTreeSet<String>,
        ready: &BTreeSet<String>,
    ) -> HashMap<String, Vec<String>> {
        let mut dependents = HashMap::new();
        if removed.is_empty() {
            return dependents;
        }
        loop {
            let mut found = Vec::new();
            for node in self.graph.present() {
                if removed.contains(&node.key)
                    || !ready.contains(&node.key)
                    || node.origin == ValueOrigin::FromSb
                {
                    continue;
                }
                let mut labels = Vec::new();
                if let Some(base) = node.derived_from.as_ref().filter(|base| removed.contains(*base)) {
                    labels.push(base.clone());
                }
                for dep in &node.deps {
                    let by_key = dep.key.as_ref().is_some_and(|key| removed.contains(key));
                    let by_selector = dep.any_of.is_some()
                        && removed.iter().any(|key| dep.is_satisfied_by(key))
                        && !self.graph.present().any(|other| {
                            other.key != node.key
                                && !removed.contains(&other.key)
                                && dep.is_satisfied_by(&other.key)
                        });
                    if by_key || by_selector {
                        labels.push(dep.label.clone());
                    }
                }
                if !labels.is_empty() {
                    found.push((node.key.clone(), labels));
                }
            }
            if found.is_empty() {
                return dependents;
            }
            for (key, labels) in found {
                removed.insert(key.clone());
                dependents.insert(key, labels);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    Add,
    Modify,
    Recreate,
}

fn planned_op(key: &str, planned: &Planned, operation: TxnOperation, is_recreate: bool) -> PlannedOp {
    PlannedOp {
        key: key.to_owned(),
        operation,
        value: Some(Arc::clone(&planned.value)),
        descriptor: planned.descriptor.clone(),
        derived_from: planned.derived_from.clone(),
        deps: planned.deps.clone(),
        is_recreate,
        after_delete: None,
    }
}

/// Dependencies of `op` restricted to the keys of `universe`
fn op_deps(op: &PlannedOp, universe: &BTreeSet<String>) -> Box<dyn KeySet> {
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    if let Some(base) = &op.derived_from {
        if universe.contains(base) {
            keys.insert(base);
        }
    }
    for dep in &op.deps {
        if let Some(key) = &dep.key {
            if universe.contains(key) {
                keys.insert(key);
            }
        }
        if dep.any_of.is_some() {
            keys.extend(
                universe
                    .iter()
                    .filter(|k| **k != op.key && dep.is_satisfied_by(k))
                    .map(String::as_str),
            );
        }
    }
    keys.remove(op.key.as_str());
    if keys.len() == 1 {
        Box::new(SingletonKeySet::new(keys.first().copied().unwrap_or_default()))
    } else {
        Box::new(SliceKeySet::new(keys))
    }
}

/// Order operations by their dependencies
fn order(ops: Vec<PlannedOp>, deletes: bool) -> Vec<PlannedOp> {
    if ops.is_empty() {
        return ops;
    }
    let universe: BTreeSet<String> = ops.iter().map(|op| op.key.clone()).collect();
    let deps: KeyDeps = ops
        .iter()
        .map(|op| (op.key.clone(), op_deps(op, &universe)))
        .collect();
    let keys: MapKeySet = universe.iter().collect();

    let sorted = match topological_order(&keys, &deps, !deletes, true) {
        Ok(sorted) => sorted,
        Err(err) => {
            warn!(error = %err, "Falling back to key order");
            universe.iter().cloned().collect()
        }
    };
    let mut by_key: HashMap<String, PlannedOp> =
        ops.into_iter().map(|op| (op.key.clone(), op)).collect();
    sorted
        .iter()
        .filter_map(|key| by_key.remove(key))
        .collect()
}
