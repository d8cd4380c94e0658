//! Scheduler's view of every known value

use crate::api::{Dependency, Metadata, TxnOperation, Value, ValueOrigin, ValueState, ValueStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Known value with its lifecycle bookkeeping
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) key: String,
    /// Owning descriptor; `None` for derived properties
    pub(crate) descriptor: Option<String>,
    /// Value present in southbound, `None` if not applied
    pub(crate) value: Option<Value>,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) origin: ValueOrigin,
    pub(crate) state: ValueState,
    pub(crate) last_op: TxnOperation,
    pub(crate) error: Option<Arc<anyhow::Error>>,
    pub(crate) details: Vec<String>,
    /// Base value this one was derived from
    pub(crate) derived_from: Option<String>,
    /// Dependencies the present value was applied with
    pub(crate) deps: Vec<Dependency>,
    /// Desired value whose last attempt failed; not re-attempted unless forced
    pub(crate) failed_value: Option<Value>,
    /// Failed attempts of `failed_value`
    pub(crate) attempts: u32,
    /// Sequence number of the transaction which last changed the desired value
    pub(crate) last_update: u64,
}

impl Node {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            descriptor: None,
            value: None,
            metadata: None,
            origin: ValueOrigin::Unknown,
            state: ValueState::NonExistent,
            last_op: TxnOperation::Undefined,
            error: None,
            details: Vec::new(),
            derived_from: None,
            deps: Vec::new(),
            failed_value: None,
            attempts: 0,
            last_update: 0,
        }
    }

    #[inline]
    pub(crate) fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub(crate) fn status(&self) -> ValueStatus {
        ValueStatus {
            key: self.key.clone(),
            state: self.state,
            last_operation: self.last_op,
            error: self.error.as_ref().map(|err| format!("{err:#}")),
            details: self.details.clone(),
        }
    }

    /// Reset failure bookkeeping after success or a value change
    pub(crate) fn clear_failure(&mut self) {
        self.error = None;
        self.failed_value = None;
        self.attempts = 0;
    }
}

/// All values known to the scheduler, ordered by key
#[derive(Debug, Default)]
pub(crate) struct Graph {
    nodes: BTreeMap<String, Node>,
}

impl Graph {
    pub(crate) fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub(crate) fn node_mut(&mut self, key: &str) -> &mut Node {
        self.nodes
            .entry(key.to_owned())
            .or_insert_with(|| Node::new(key))
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Node> {
        self.nodes.remove(key)
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub(crate) fn present(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|node| node.is_present())
    }

    pub(crate) fn is_present(&self, key: &str) -> bool {
        self.nodes.get(key).is_some_and(Node::is_present)
    }

    /// Keys derived (directly) from `base`
    pub(crate) fn derived_of(&self, base: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.derived_from.as_deref() == Some(base))
            .map(|node| node.key.clone())
            .collect()
    }

    /// Derived values of `base` at any depth, sorted by key
    pub(crate) fn descendants(&self, base: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut queue = self.derived_of(base);
        while let Some(key) = queue.pop() {
            queue.extend(self.derived_of(&key));
            found.push(key);
        }
        found.sort();
        found
    }

    /// Base value `key` was (transitively) derived from, or `key` itself
    pub(crate) fn base_of(&self, key: &str) -> String {
        let mut current = key;
        while let Some(base) = self.nodes.get(current).and_then(|n| n.derived_from.as_deref()) {
            if base == key {
                break;
            }
            current = base;
        }
        current.to_owned()
    }

    /// True if a present value satisfies `dep`
    pub(crate) fn satisfies(&self, dep: &Dependency) -> bool {
        if let Some(key) = &dep.key {
            if self.is_present(key) {
                return true;
            }
        }
        dep.any_of.is_some() && self.present().any(|node| dep.is_satisfied_by(&node.key))
    }

    /// Drop absent values nobody asks for; returns the dropped keys
    pub(crate) fn collect_garbage(&mut self, wanted: impl Fn(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.nodes.retain(|key, node| {
            let keep = node.is_present() || wanted(key);
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });
        dropped
    }
}
