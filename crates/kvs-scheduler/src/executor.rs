//! Execution of planned operations
//!
//! Operations run one by one in plan order. Failures are recorded per key
//! and never abort the remaining plan, unless the transaction asked to stop
//! on the first failure.

use crate::api::{Metadata, TxnOperation, Value, ValueOrigin, ValueState};
use crate::config::RetryOpt;
use crate::error::{invalid_fields, KeyWithError};
use crate::graph::{Graph, Node};
use crate::planner::PlannedOp;
use crate::registry::DescriptorRegistry;
use crate::txn::RecordedTxnOp;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Settings of one execution pass
#[derive(Debug, Default)]
pub(crate) struct ExecContext {
    /// Retry policy, `None` disables retries
    pub(crate) retry: Option<RetryOpt>,
    /// Stop at the first failed operation
    pub(crate) stop_on_failure: bool,
    pub(crate) is_retry: bool,
    pub(crate) is_revert: bool,
    pub(crate) cancel: Vec<CancellationToken>,
}

impl ExecContext {
    fn is_cancelled(&self) -> bool {
        self.cancel.iter().any(CancellationToken::is_cancelled)
    }
}

/// Result of one execution pass
#[derive(Debug, Default)]
pub(crate) struct Execution {
    pub(crate) executed: Vec<RecordedTxnOp>,
    pub(crate) errors: Vec<KeyWithError>,
    /// Keys scheduled for retry with their failed attempts so far
    pub(crate) retries: Vec<(String, u32)>,
    pub(crate) failed: bool,
    pub(crate) cancelled: bool,
}

/// Execute `ops` against their descriptors, updating `graph`
pub(crate) fn execute(
    ctx: &ExecContext,
    registry: &DescriptorRegistry,
    graph: &mut Graph,
    ops: Vec<PlannedOp>,
) -> Execution {
    let mut out = Execution::default();
    let mut upcoming: HashSet<String> = ops
        .iter()
        .filter(|op| op.operation != TxnOperation::Delete)
        .map(|op| op.key.clone())
        .collect();

    for op in ops {
        if ctx.is_cancelled() {
            warn!(key = %op.key, "Transaction cancelled, skipping remaining operations");
            out.cancelled = true;
            break;
        }
        if op.operation != TxnOperation::Delete {
            upcoming.remove(&op.key);
            if skip_update(graph, &op, &upcoming) {
                continue;
            }
        } else if !graph.is_present(&op.key) {
            continue;
        }

        let node = graph.node_mut(&op.key);
        let prev_state = node.state;
        let prev_value = node.value.clone();
        match apply(&op, node) {
            Ok(metadata) => {
                succeeded(registry, node, &op, metadata);
                debug!(key = %op.key, op = %op.operation, "Executed operation");
                out.executed
                    .push(record(ctx, &op, prev_value.as_ref(), prev_state, node));
            }
            Err(err) => {
                let err = Arc::new(err);
                if let Some(attempts) = failed(ctx, node, &op, &err) {
                    out.retries.push((op.key.clone(), attempts));
                }
                warn!(key = %op.key, op = %op.operation, state = %node.state, error = %err, "Operation failed");
                out.executed
                    .push(record(ctx, &op, prev_value.as_ref(), prev_state, node));
                out.errors.push(KeyWithError {
                    key: op.key.clone(),
                    operation: op.operation,
                    error: err,
                });
                out.failed = true;
                if ctx.stop_on_failure {
                    break;
                }
            }
        }
    }
    out
}

/// Re-check an add or modify against the values present right now
fn skip_update(graph: &mut Graph, op: &PlannedOp, upcoming: &HashSet<String>) -> bool {
    if op.is_recreate && op.operation == TxnOperation::Add && graph.is_present(&op.key) {
        debug!(key = %op.key, "Delete of recreated value failed, skipping add");
        return true;
    }
    let mut unmet = Vec::new();
    if let Some(base) = &op.derived_from {
        if !graph.is_present(base) {
            unmet.push(base.clone());
        }
    }
    for dep in &op.deps {
        let upcoming_match = upcoming
            .iter()
            .any(|key| *key != op.key && dep.is_satisfied_by(key));
        if !graph.satisfies(dep) && !upcoming_match {
            unmet.push(dep.label.clone());
        }
    }
    if unmet.is_empty() {
        return false;
    }
    debug!(key = %op.key, unmet = ?unmet, "Dependencies no longer satisfied, value is pending");
    let node = graph.node_mut(&op.key);
    node.state = ValueState::Pending;
    node.error = None;
    node.details = unmet;
    true
}

fn apply(op: &PlannedOp, node: &Node) -> anyhow::Result<Option<Metadata>> {
    let Some(descriptor) = &op.descriptor else {
        return Ok(None);
    };
    let key = op.key.as_str();
    match (op.operation, node.value.as_ref(), op.value.as_ref()) {
        (TxnOperation::Add, _, Some(new)) => descriptor.add(key, new),
        (TxnOperation::Modify, Some(old), Some(new)) => {
            descriptor.modify(key, old, new, node.metadata.as_ref())
        }
        (TxnOperation::Modify, None, Some(new)) => descriptor.add(key, new),
        (TxnOperation::Delete, Some(old), _) => descriptor
            .delete(key, old, node.metadata.as_ref())
            .map(|()| None),
        (operation, ..) => Err(anyhow::anyhow!("nothing to {operation} for {key}")),
    }
}

fn succeeded(registry: &DescriptorRegistry, node: &mut Node, op: &PlannedOp, metadata: Option<Metadata>) {
    let metadata_map = op
        .descriptor
        .as_ref()
        .filter(|desc| desc.with_metadata() && !op.is_derived())
        .and_then(|desc| registry.metadata_map(desc.name()).map(|map| (desc.key_label(&op.key), map)));

    node.last_op = op.operation;
    node.descriptor = op.descriptor.as_ref().map(|desc| desc.name().to_owned());
    node.derived_from.clone_from(&op.derived_from);

    if op.operation == TxnOperation::Delete {
        if let Some((label, map)) = metadata_map {
            map.delete(&label);
        }
        node.value = None;
        node.metadata = None;
        node.deps.clear();
        match &op.after_delete {
            Some((ValueState::Invalid, details)) => {
                node.state = ValueState::Invalid;
                node.details.clone_from(details);
            }
            Some((state, details)) => {
                node.state = *state;
                node.details.clone_from(details);
                node.clear_failure();
            }
            None => {
                node.state = ValueState::Removed;
                node.details.clear();
                node.clear_failure();
            }
        }
        return;
    }

    if let Some((label, map)) = metadata_map {
        match &metadata {
            Some(metadata) => map.put(&label, Arc::clone(metadata)),
            None => {
                map.delete(&label);
            }
        }
    }
    node.value.clone_from(&op.value);
    node.metadata = metadata;
    node.origin = ValueOrigin::FromNb;
    node.state = ValueState::Configured;
    node.details.clear();
    node.deps.clone_from(&op.deps);
    node.clear_failure();
}

/// Update `node` after a failed operation; returns the attempts so far if a
/// retry should be scheduled
fn failed(ctx: &ExecContext, node: &mut Node, op: &PlannedOp, err: &Arc<anyhow::Error>) -> Option<u32> {
    let retriable = op
        .descriptor
        .as_ref()
        .map_or(true, |desc| desc.is_retriable_failure(err));
    let fields = invalid_fields(err);

    node.attempts += 1;
    node.last_op = op.operation;
    node.error = Some(Arc::clone(err));
    node.failed_value.clone_from(&op.value);
    node.details = fields.clone().unwrap_or_default();

    let retry = ctx
        .retry
        .filter(|retry| fields.is_none() && retriable && node.attempts < retry.max_count);
    node.state = match (&fields, retry) {
        (Some(_), _) => ValueState::Invalid,
        (None, Some(_)) => ValueState::Retrying,
        (None, None) => ValueState::Failed,
    };
    retry.map(|_| node.attempts)
}

/// Record of an operation as planned, before it runs
pub(crate) fn planned_record(ctx: &ExecContext, graph: &Graph, op: &PlannedOp) -> RecordedTxnOp {
    let node = graph.get(&op.key);
    let new_state = match (&op.operation, &op.after_delete) {
        (TxnOperation::Delete, Some((state, _))) => *state,
        (TxnOperation::Delete, None) => ValueState::Removed,
        _ => ValueState::Configured,
    };
    RecordedTxnOp {
        key: op.key.clone(),
        operation: op.operation,
        prev_value: node
            .and_then(|n| n.value.as_ref())
            .map(|v| format!("{v:?}")),
        new_value: op.value.as_ref().map(|v| format!("{v:?}")),
        prev_state: node.map_or(ValueState::NonExistent, |n| n.state),
        new_state,
        error: None,
        is_derived: op.is_derived(),
        is_recreate: op.is_recreate,
        is_retry: ctx.is_retry,
        is_revert: ctx.is_revert,
    }
}

fn record(
    ctx: &ExecContext,
    op: &PlannedOp,
    prev_value: Option<&Value>,
    prev_state: ValueState,
    node: &Node,
) -> RecordedTxnOp {
    RecordedTxnOp {
        key: op.key.clone(),
        operation: op.operation,
        prev_value: prev_value.map(|v| format!("{v:?}")),
        new_value: op.value.as_ref().map(|v| format!("{v:?}")),
        prev_state,
        new_state: node.state,
        error: node
            .error
            .as_ref()
            .filter(|_| matches!(node.state, ValueState::Failed | ValueState::Retrying | ValueState::Invalid))
            .map(|err| err.to_string()),
        is_derived: op.is_derived(),
        is_recreate: op.is_recreate,
        is_retry: ctx.is_retry,
        is_revert: ctx.is_revert,
    }
}
