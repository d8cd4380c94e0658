//! Scheduler configuration

use crate::error::SchedulerError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry policy for failed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryOpt {
    /// Delay before the first retry in milliseconds
    pub period_ms: u64,
    /// Maximum number of attempts, the initial one included
    pub max_count: u32,
    /// Double the delay with every attempt
    pub exp_backoff: bool,
}

impl RetryOpt {
    /// Create retry policy
    #[inline]
    #[must_use]
    pub fn new(period: Duration, max_count: u32, exp_backoff: bool) -> Self {
        Self {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            max_count,
            exp_backoff,
        }
    }

    /// Delay before the retry following `attempt` failed attempts
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let period = Duration::from_millis(self.period_ms);
        if !self.exp_backoff || attempt <= 1 {
            return period;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        period.saturating_mul(factor)
    }
}

impl Default for RetryOpt {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            max_count: 3,
            exp_backoff: true,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Keep a history of processed transactions
    pub record_transaction_history: bool,
    /// Recorded transactions older than this are trimmed, in minutes
    pub transaction_history_age_limit_mins: u64,
    /// Transactions started within this period after startup are never trimmed, in minutes
    pub permanently_recorded_init_period_mins: u64,
    /// How often the history is trimmed, in seconds
    pub history_trim_period_secs: u64,
    /// Capacity of the transaction queue
    pub transaction_queue_capacity: usize,
    /// Retry failed operations unless a transaction opts out
    pub enable_txn_retry: bool,
    /// Default retry policy
    pub retry: RetryOpt,
}

impl SchedulerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML
    ///
    /// # Errors
    /// Returns error if the document is not valid configuration
    pub fn from_toml_str(content: &str) -> Result<Self, SchedulerError> {
        toml::from_str(content).map_err(|err| SchedulerError::Config(err.to_string()))
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| SchedulerError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// With transaction history recording
    #[inline]
    #[must_use]
    pub fn with_history(mut self, record: bool) -> Self {
        self.record_transaction_history = record;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryOpt) -> Self {
        self.retry = retry;
        self.enable_txn_retry = true;
        self
    }

    /// Without retries by default
    #[inline]
    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.enable_txn_retry = false;
        self
    }

    /// With transaction queue capacity
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.transaction_queue_capacity = capacity.max(1);
        self
    }

    /// History age limit
    #[must_use]
    pub fn history_age_limit(&self) -> Duration {
        Duration::from_secs(self.transaction_history_age_limit_mins.saturating_mul(60))
    }

    /// Permanently recorded init period
    #[must_use]
    pub fn permanent_init_period(&self) -> Duration {
        Duration::from_secs(self.permanently_recorded_init_period_mins.saturating_mul(60))
    }

    /// History trimming period
    #[must_use]
    pub fn history_trim_period(&self) -> Duration {
        Duration::from_secs(self.history_trim_period_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            record_transaction_history: true,
            transaction_history_age_limit_mins: 24 * 60,
            permanently_recorded_init_period_mins: 60,
            history_trim_period_secs: 60,
            transaction_queue_capacity: 100,
            enable_txn_retry: true,
            retry: RetryOpt::default(),
        }
    }
}
