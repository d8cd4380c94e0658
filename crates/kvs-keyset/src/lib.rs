//! KV Scheduler key sets
//!
//! Set-of-keys abstraction with interchangeable backing representations,
//! plus dependency queries and deterministic topological ordering.
//!
//! # Overview
//!
//! - **SingletonKeySet**: at most one key, used for single dependencies
//! - **SliceKeySet**: sorted vector, small footprint and cheap copies
//! - **MapKeySet**: hash set, fast lookups on large sets
//! - **topological_order**: Kahn's algorithm with explicit cycle handling
//!
//! # Example
//!
//! ```rust
//! use kvs_keyset::{topological_order, KeyDeps, KeySet, SliceKeySet};
//!
//! let mut deps = KeyDeps::new();
//! deps.insert("leaf".to_string(), Box::new(SliceKeySet::new(["bridge"])));
//!
//! let keys = SliceKeySet::new(["leaf", "bridge"]);
//! let order = topological_order(&keys, &deps, true, false).unwrap();
//! assert_eq!(order, ["bridge", "leaf"]);
//! ```

pub mod deps;
pub mod error;
pub mod keyset;
pub mod map;
pub mod singleton;
pub mod slice;

// Re-exports
pub use deps::{depends_on, key_depends_on, topological_order, KeyDeps};
pub use error::DependencyCycle;
pub use keyset::KeySet;
pub use map::MapKeySet;
pub use singleton::SingletonKeySet;
pub use slice::SliceKeySet;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
