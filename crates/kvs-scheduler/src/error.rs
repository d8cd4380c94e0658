//! Error types for the scheduler
//!
//! Structural errors (duplicate descriptors, dump dependency cycles) are
//! returned at wiring time. Per-value failures never abort a transaction;
//! they are collected into [`TransactionError`].

use crate::api::TxnOperation;
use kvs_keyset::DependencyCycle;
use std::fmt;
use std::sync::Arc;

/// Scheduler-level errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// Scheduler was closed
    #[error("scheduler is closed")]
    Closed,

    /// Transaction queue is full (non-blocking commit)
    #[error("transaction queue is full")]
    TxnQueueFull,

    /// Descriptor with the same name already registered
    #[error("descriptor {0} is already registered")]
    DuplicateDescriptor(String),

    /// Dump dependencies between descriptors form a cycle
    #[error("descriptor dump dependencies: {0}")]
    DumpDependencyCycle(#[from] DependencyCycle),

    /// No descriptor registered under the name
    #[error("descriptor {0} is not registered")]
    UnknownDescriptor(String),

    /// Descriptor does not support dump
    #[error("descriptor {0} does not support dump")]
    NotDumpable(String),

    /// Descriptor dump failed
    #[error("dump of descriptor {descriptor} failed: {error}")]
    DumpFailed {
        /// Descriptor name
        descriptor: String,
        /// Underlying error
        error: Arc<anyhow::Error>,
    },

    /// Transaction was cancelled before all operations executed
    #[error("transaction was cancelled")]
    Cancelled,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    /// Check if the error indicates the scheduler can no longer be used
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Value rejected by descriptor validation.
///
/// Returned from [`KvDescriptor::validate`](crate::KvDescriptor::validate);
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value: {message} (invalid fields: {})", .invalid_fields.join(", "))]
pub struct InvalidValueError {
    /// Reason of the rejection
    pub message: String,
    /// Names of the offending fields
    pub invalid_fields: Vec<String>,
}

impl InvalidValueError {
    /// Create validation error
    pub fn new<I, S>(message: impl Into<String>, invalid_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            message: message.into(),
            invalid_fields: invalid_fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Failure of a single operation within a transaction
#[derive(Debug, Clone)]
pub struct KeyWithError {
    /// Key of the failed value
    pub key: String,
    /// Operation which failed
    pub operation: TxnOperation,
    /// Error returned by the descriptor
    pub error: Arc<anyhow::Error>,
}

/// Result of a transaction which did not fully succeed
#[derive(Debug, Clone, Default)]
pub struct TransactionError {
    /// Sequence number, if the transaction got processed
    pub seq_num: Option<u64>,
    /// Error which prevented the transaction from being processed
    pub txn_init_error: Option<SchedulerError>,
    /// Failures of individual values
    pub kv_errors: Vec<KeyWithError>,
    /// Descriptors whose dump failed during a resync, as
    /// [`SchedulerError::DumpFailed`]; their values were left as they were
    pub dump_errors: Vec<SchedulerError>,
}

impl TransactionError {
    /// Transaction failed before processing
    #[must_use]
    pub fn init(error: SchedulerError) -> Self {
        Self {
            seq_num: None,
            txn_init_error: Some(error),
            kv_errors: Vec::new(),
            dump_errors: Vec::new(),
        }
    }

    /// Error recorded for `key`, if any
    #[must_use]
    pub fn error_for(&self, key: &str) -> Option<&KeyWithError> {
        self.kv_errors.iter().find(|kv| kv.key == key)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.txn_init_error {
            return write!(f, "transaction failed: {err}");
        }
        write!(f, "{} operation(s) failed", self.kv_errors.len())?;
        for kv in &self.kv_errors {
            write!(f, "; {} {}: {}", kv.operation, kv.key, kv.error)?;
        }
        for err in &self.dump_errors {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.txn_init_error
            .as_ref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<SchedulerError> for TransactionError {
    fn from(error: SchedulerError) -> Self {
        Self::init(error)
    }
}

/// Fields of an [`InvalidValueError`] wrapped in `err`
pub(crate) fn invalid_fields(err: &anyhow::Error) -> Option<Vec<String>> {
    err.downcast_ref::<InvalidValueError>()
        .map(|invalid| invalid.invalid_fields.clone())
}
