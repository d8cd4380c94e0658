//! KV Scheduler name-to-index registry
//!
//! Concurrency-safe bidirectional mapping between logical names and numeric
//! indexes, with pluggable secondary indexes over metadata and watchers
//! notified of every change.
//!
//! # Example
//!
//! ```rust
//! use kvs_idxmap::NameToIdx;
//! use std::collections::HashMap;
//!
//! let mapping = NameToIdx::with_index("interfaces", |up: &bool| {
//!     HashMap::from([("up".to_string(), vec![up.to_string()])])
//! });
//! mapping.register_name("eth0", 1, true);
//! mapping.register_name("eth1", 2, false);
//!
//! assert_eq!(mapping.lookup_idx("eth0"), Some((1, true)));
//! assert_eq!(mapping.lookup_name(2), Some(("eth1".to_string(), false)));
//! assert_eq!(mapping.lookup_name_by_metadata("up", "true"), ["eth0"]);
//! ```

pub mod error;
pub mod event;
pub mod mapping;

// Re-exports
pub use error::IdxMapError;
pub use event::{to_chan, to_chan_with_ack, to_chan_with_timeout, NameToIdxEvent, DEFAULT_NOTIF_TIMEOUT};
pub use mapping::{IndexFn, NameToIdx};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
