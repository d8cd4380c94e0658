//! KV Scheduler
//!
//! Reconciles a desired set of key-value pairs (northbound) with the actual
//! state of a backend (southbound). Plugins describe classes of values
//! through [`KvDescriptor`]s: how to create, update and remove them, what
//! they depend on and which values they imply. The scheduler orders the
//! operations so that dependencies exist before dependents, holds values
//! with unmet dependencies as pending, retries failed operations and keeps
//! a queryable history of every transaction.
//!
//! # Example
//!
//! ```rust
//! use kvs_scheduler::prelude::*;
//! use kvs_scheduler::test_harness::{bridge_key, Bridge, BridgeDescriptor, MemorySouthbound};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let southbound = MemorySouthbound::new();
//! let scheduler = KvScheduler::new(SchedulerConfig::default());
//! scheduler.register_descriptor(BridgeDescriptor::new(southbound.clone()))?;
//!
//! scheduler
//!     .start_nb_transaction()
//!     .set_value(bridge_key("br0"), new_value(Bridge::new("br0")))
//!     .commit(TxnOptions::new())
//!     .await?;
//!
//! assert!(southbound.contains("bridge/br0"));
//! assert_eq!(scheduler.value_status("bridge/br0").value.state, ValueState::Configured);
//! scheduler.close().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod scheduler;
pub mod test_harness;
pub mod txn;

mod executor;
mod graph;
mod planner;
mod refresh;

// Re-exports
pub use api::{
    metadata_as, new_metadata, new_value, prefix_selector, value_as, BaseValueStatus, Dependency,
    DumpView, KeySelector, KeyValuePair, KvValue, KvWithMetadata, Metadata, TxnOperation, Value,
    ValueOrigin, ValueState, ValueStatus,
};
pub use config::{RetryOpt, SchedulerConfig};
pub use descriptor::KvDescriptor;
pub use error::{InvalidValueError, KeyWithError, SchedulerError, TransactionError};
pub use metadata::{IndexedMetadataMap, MetadataMap};
pub use registry::DescriptorRegistry;
pub use scheduler::KvScheduler;
pub use txn::{
    RecordedKv, RecordedTxn, RecordedTxnOp, ResyncType, RetryPolicy, Txn, TxnOptions, TxnType,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
pub mod prelude {
    pub use crate::api::{new_value, value_as, Dependency, Value, ValueOrigin, ValueState};
    pub use crate::config::{RetryOpt, SchedulerConfig};
    pub use crate::descriptor::KvDescriptor;
    pub use crate::error::{InvalidValueError, SchedulerError, TransactionError};
    pub use crate::scheduler::KvScheduler;
    pub use crate::txn::{ResyncType, RetryPolicy, TxnOptions};
}
