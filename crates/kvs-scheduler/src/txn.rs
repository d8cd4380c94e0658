//! Transactions, their options and their recorded form

use crate::api::{Metadata, TxnOperation, Value, ValueState};
use crate::config::RetryOpt;
use crate::error::{SchedulerError, TransactionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How an NB transaction synchronizes with southbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncType {
    /// Refresh from southbound, then replace the desired state
    Full,
    /// Replace the desired state without refreshing
    Upstream,
    /// Refresh from southbound and re-apply the current desired state
    Downstream,
}

/// Source of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnType {
    /// Desired state change requested by northbound
    NbTransaction,
    /// Change observed in southbound
    SbNotification,
    /// Scheduled retry of failed operations
    RetryFailedOps,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NbTransaction => "NB-txn",
            Self::SbNotification => "SB-notif",
            Self::RetryFailedOps => "retry",
        };
        f.write_str(name)
    }
}

/// Retry behaviour of a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Follow the scheduler configuration
    #[default]
    Inherit,
    /// Never retry
    Disabled,
    /// Retry with the given options
    Custom(RetryOpt),
}

/// Options of an NB transaction
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Resync to perform, `None` to apply only the listed changes
    pub resync: Option<ResyncType>,
    /// Retry behaviour for failed operations
    pub retry: RetryPolicy,
    /// Restore the previous desired state if any operation fails
    pub revert_on_failure: bool,
    /// Free-form description kept in the transaction history
    pub description: String,
    /// Stops execution before the next operation once cancelled
    pub cancel: Option<CancellationToken>,
}

impl TxnOptions {
    /// Create default options
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With resync
    #[inline]
    #[must_use]
    pub fn with_resync(mut self, resync: ResyncType) -> Self {
        self.resync = Some(resync);
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With revert on failure
    #[inline]
    #[must_use]
    pub fn with_revert(mut self) -> Self {
        self.revert_on_failure = true;
        self
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// With cancellation token
    #[inline]
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn effective_retry(&self, enabled: bool, default: RetryOpt) -> Option<RetryOpt> {
        match self.retry {
            RetryPolicy::Inherit => enabled.then_some(default),
            RetryPolicy::Disabled => None,
            RetryPolicy::Custom(retry) => Some(retry),
        }
    }
}

/// Operation as planned or executed within a recorded transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedTxnOp {
    /// Key
    pub key: String,
    /// Operation
    pub operation: TxnOperation,
    /// Value before the operation
    pub prev_value: Option<String>,
    /// Value after the operation
    pub new_value: Option<String>,
    /// State before the operation
    pub prev_state: ValueState,
    /// State after the operation
    pub new_state: ValueState,
    /// Error returned by the descriptor
    pub error: Option<String>,
    /// Operation on a derived value
    pub is_derived: bool,
    /// Part of a delete followed by add
    pub is_recreate: bool,
    /// Executed by a retry transaction
    pub is_retry: bool,
    /// Executed while reverting a failed transaction
    pub is_revert: bool,
}

/// Key-value pair of a recorded transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedKv {
    /// Key
    pub key: String,
    /// Value, `None` for deletes
    pub value: Option<String>,
}

/// Processed transaction kept in the history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedTxn {
    /// Sequence number
    pub seq_num: u64,
    /// Source of the transaction
    pub txn_type: TxnType,
    /// Resync performed by an NB transaction
    pub resync_type: Option<ResyncType>,
    /// Description given by northbound
    pub description: String,
    /// Processing start
    pub start: DateTime<Utc>,
    /// Processing end
    pub stop: DateTime<Utc>,
    /// Values carried by the transaction
    pub values: Vec<RecordedKv>,
    /// Operations planned before execution
    pub planned: Vec<RecordedTxnOp>,
    /// Operations actually executed
    pub executed: Vec<RecordedTxnOp>,
    /// Dumps which failed during a resync
    #[serde(default)]
    pub dump_errors: Vec<String>,
}

impl RecordedTxn {
    /// True if every executed operation succeeded and no dump failed
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.dump_errors.is_empty() && self.executed.iter().all(|op| op.error.is_none())
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.seq_num, self.txn_type)?;
        if let Some(resync) = self.resync_type {
            write!(f, " ({resync:?} resync)")?;
        }
        if !self.description.is_empty() {
            write!(f, " \"{}\"", self.description)?;
        }
        writeln!(f)?;
        for err in &self.dump_errors {
            writeln!(f, "  ! {err}")?;
        }
        for op in &self.executed {
            write!(f, "  {} {}", op.operation, op.key)?;
            if op.is_recreate {
                f.write_str(" [recreate]")?;
            }
            if op.is_retry {
                f.write_str(" [retry]")?;
            }
            if op.is_revert {
                f.write_str(" [revert]")?;
            }
            match &op.error {
                Some(err) => writeln!(f, " -> {} ({err})", op.new_state)?,
                None => writeln!(f, " -> {}", op.new_state)?,
            }
        }
        Ok(())
    }
}

pub(crate) type TxnReply = oneshot::Sender<Result<u64, TransactionError>>;

/// Work item of the transaction queue
pub(crate) enum TxnKind {
    Nb {
        values: Vec<(String, Option<Value>)>,
        opts: TxnOptions,
    },
    Sb {
        key: String,
        value: Option<Value>,
        metadata: Option<Metadata>,
    },
    Retry {
        keys: Vec<String>,
        origin_seq: u64,
        retry: RetryOpt,
    },
    Barrier,
}

pub(crate) struct QueuedTxn {
    pub(crate) kind: TxnKind,
    pub(crate) reply: Option<TxnReply>,
}

impl QueuedTxn {
    pub(crate) fn new(kind: TxnKind, reply: Option<TxnReply>) -> Self {
        Self { kind, reply }
    }

    pub(crate) fn respond(self, result: Result<u64, TransactionError>) {
        if let Some(reply) = self.reply {
            // Committer may have stopped waiting
            let _ = reply.send(result);
        }
    }
}

/// NB transaction under construction.
///
/// Values set to `None` are deleted. Later calls for the same key override
/// earlier ones.
#[derive(Debug)]
#[must_use = "transaction does nothing until committed"]
pub struct Txn {
    values: Vec<(String, Option<Value>)>,
    queue: mpsc::Sender<QueuedTxn>,
    closed: CancellationToken,
}

impl Txn {
    pub(crate) fn new(queue: mpsc::Sender<QueuedTxn>, closed: CancellationToken) -> Self {
        Self {
            values: Vec::new(),
            queue,
            closed,
        }
    }

    /// Set desired value of `key`
    pub fn set_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.push(key.into(), Some(value));
        self
    }

    /// Remove `key` from the desired state
    pub fn delete_value(mut self, key: impl Into<String>) -> Self {
        self.push(key.into(), None);
        self
    }

    fn push(&mut self, key: String, value: Option<Value>) {
        self.values.retain(|(k, _)| *k != key);
        self.values.push((key, value));
    }

    /// Number of values in the transaction
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the transaction carries no value
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Commit and wait until the transaction is processed.
    ///
    /// # Errors
    /// Returns [`TransactionError`] with the failed operations, or with the
    /// init error if the transaction could not be processed at all
    pub async fn commit(self, opts: TxnOptions) -> Result<u64, TransactionError> {
        if self.closed.is_cancelled() {
            return Err(SchedulerError::Closed.into());
        }
        let (reply, result) = oneshot::channel();
        let txn = QueuedTxn::new(
            TxnKind::Nb {
                values: self.values,
                opts,
            },
            Some(reply),
        );
        tokio::select! {
            () = self.closed.cancelled() => return Err(SchedulerError::Closed.into()),
            sent = self.queue.send(txn) => {
                if sent.is_err() {
                    return Err(SchedulerError::Closed.into());
                }
            }
        }
        result
            .await
            .unwrap_or_else(|_| Err(SchedulerError::Closed.into()))
    }

    /// Queue the transaction without waiting for the result.
    ///
    /// # Errors
    /// Returns [`SchedulerError::TxnQueueFull`] if the queue is full and
    /// [`SchedulerError::Closed`] after the scheduler was closed
    pub fn commit_non_blocking(self, opts: TxnOptions) -> Result<(), SchedulerError> {
        if self.closed.is_cancelled() {
            return Err(SchedulerError::Closed);
        }
        let txn = QueuedTxn::new(
            TxnKind::Nb {
                values: self.values,
                opts,
            },
            None,
        );
        self.queue.try_send(txn).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SchedulerError::TxnQueueFull,
            mpsc::error::TrySendError::Closed(_) => SchedulerError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::new_value;
    use std::time::Duration;

    #[test]
    fn txn_options_builders() {
        let opts = TxnOptions::new()
            .with_resync(ResyncType::Downstream)
            .with_revert()
            .with_description("resync after restart");
        assert_eq!(opts.resync, Some(ResyncType::Downstream));
        assert!(opts.revert_on_failure);

        let default = RetryOpt::default();
        assert_eq!(opts.effective_retry(true, default), Some(default));
        assert_eq!(opts.effective_retry(false, default), None);

        let custom = RetryOpt::new(Duration::from_millis(10), 2, false);
        let opts = opts.with_retry(RetryPolicy::Custom(custom));
        assert_eq!(opts.effective_retry(false, default), Some(custom));
        let opts = opts.with_retry(RetryPolicy::Disabled);
        assert_eq!(opts.effective_retry(true, default), None);
    }

    #[test]
    fn txn_last_write_wins() {
        let (queue, _rx) = mpsc::channel(1);
        let txn = Txn::new(queue, CancellationToken::new())
            .set_value("bd/br0", new_value(1u32))
            .set_value("bd/br1", new_value(1u32))
            .delete_value("bd/br0");
        assert_eq!(txn.len(), 2);
        assert_eq!(txn.values[1].0, "bd/br0");
        assert!(txn.values[1].1.is_none());
    }

    #[test]
    fn txn_non_blocking_queue_full() {
        let (queue, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        Txn::new(queue.clone(), token.clone())
            .set_value("a", new_value(1u32))
            .commit_non_blocking(TxnOptions::new())
            .unwrap();
        let err = Txn::new(queue.clone(), token.clone())
            .set_value("b", new_value(1u32))
            .commit_non_blocking(TxnOptions::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TxnQueueFull));

        token.cancel();
        let err = Txn::new(queue, token)
            .commit_non_blocking(TxnOptions::new())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
