//! Core value types shared by descriptors and the scheduler

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Configuration value managed by the scheduler.
///
/// Implemented for every `Debug + PartialEq` type, so plugins use their own
/// typed values and downcast at the edges with [`value_as`].
pub trait KvValue: Any + fmt::Debug + Send + Sync {
    /// Access to the concrete value type
    fn as_any(&self) -> &dyn Any;

    /// Structural equality across the type-erased boundary
    fn equals(&self, other: &dyn KvValue) -> bool;
}

impl<T: Any + fmt::Debug + PartialEq + Send + Sync> KvValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn KvValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

/// Shared, type-erased value
pub type Value = Arc<dyn KvValue>;

/// Opaque metadata produced by descriptors
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Predicate selecting keys
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Wrap a typed value
pub fn new_value<T: KvValue>(value: T) -> Value {
    Arc::new(value)
}

/// Wrap typed metadata
pub fn new_metadata<T: Any + Send + Sync>(metadata: T) -> Metadata {
    Arc::new(metadata)
}

/// Typed view of a value
#[must_use]
pub fn value_as<T: Any>(value: &Value) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

/// Typed view of metadata
#[must_use]
pub fn metadata_as<T: Any>(metadata: &Metadata) -> Option<&T> {
    metadata.downcast_ref::<T>()
}

/// Selector matching every key with the given prefix
pub fn prefix_selector(prefix: &str) -> KeySelector {
    let prefix = prefix.to_owned();
    Arc::new(move |key: &str| key.starts_with(&prefix))
}

/// Key paired with its value
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    /// Key
    pub key: String,
    /// Value
    pub value: Value,
}

impl KeyValuePair {
    /// Create pair
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Value which must exist before the dependent value can be created.
///
/// Either a concrete `key`, or `any_of` satisfied by any existing key the
/// selector accepts.
#[derive(Clone)]
pub struct Dependency {
    /// Human readable label, reported for unmet dependencies
    pub label: String,
    /// Key of the required value
    pub key: Option<String>,
    /// Selector of acceptable values
    pub any_of: Option<KeySelector>,
}

impl Dependency {
    /// Dependency on a single key
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: Some(key.into()),
            any_of: None,
        }
    }

    /// Dependency satisfied by any key matched by `selector`
    pub fn any_of(label: impl Into<String>, selector: KeySelector) -> Self {
        Self {
            label: label.into(),
            key: None,
            any_of: Some(selector),
        }
    }

    /// True if `key` satisfies this dependency
    #[must_use]
    pub fn is_satisfied_by(&self, key: &str) -> bool {
        if self.key.as_deref() == Some(key) {
            return true;
        }
        self.any_of.as_ref().is_some_and(|selector| selector(key))
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("label", &self.label)
            .field("key", &self.key)
            .field("any_of", &self.any_of.is_some())
            .finish()
    }
}

/// Where a value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Not known, resolved by the scheduler during refresh
    #[default]
    Unknown,
    /// Requested by northbound
    FromNb,
    /// Created in southbound outside of the scheduler
    FromSb,
}

/// Dumped or correlated value with its metadata
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    /// Key
    pub key: String,
    /// Value
    pub value: Value,
    /// Metadata of the value, if the descriptor keeps any
    pub metadata: Option<Metadata>,
    /// Origin of the value
    pub origin: ValueOrigin,
}

/// Operation executed on a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxnOperation {
    /// No operation
    #[default]
    Undefined,
    /// Create the value
    Add,
    /// Update the value in place
    Modify,
    /// Remove the value
    Delete,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "UNDEFINED",
            Self::Add => "ADD",
            Self::Modify => "MODIFY",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueState {
    /// Not known to the scheduler
    #[default]
    NonExistent,
    /// Requested but waiting for unmet dependencies
    Pending,
    /// Rejected by validation
    Invalid,
    /// Applied in southbound
    Configured,
    /// Found in southbound without being requested
    Retrieved,
    /// Last operation failed and will not be retried
    Failed,
    /// Last operation failed and a retry is scheduled
    Retrying,
    /// Removed from southbound
    Removed,
    /// Requested but no descriptor owns the key
    Unimplemented,
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonExistent => "NONEXISTENT",
            Self::Pending => "PENDING",
            Self::Invalid => "INVALID",
            Self::Configured => "CONFIGURED",
            Self::Retrieved => "RETRIEVED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Removed => "REMOVED",
            Self::Unimplemented => "UNIMPLEMENTED",
        };
        f.write_str(name)
    }
}

/// Status of a single value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueStatus {
    /// Key
    pub key: String,
    /// Current state
    pub state: ValueState,
    /// Last operation executed on the value
    pub last_operation: TxnOperation,
    /// Error of the last operation
    pub error: Option<String>,
    /// Unmet dependencies for pending values, invalid fields for invalid ones
    pub details: Vec<String>,
}

impl ValueStatus {
    /// Status of a value unknown to the scheduler
    #[must_use]
    pub fn non_existent(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            state: ValueState::NonExistent,
            last_operation: TxnOperation::Undefined,
            error: None,
            details: Vec::new(),
        }
    }
}

/// Status of a base value together with its derived values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseValueStatus {
    /// Status of the base value
    pub value: ValueStatus,
    /// Status of every value derived from it
    pub derived: Vec<ValueStatus>,
}

/// Which view of the values to dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpView {
    /// Read directly from southbound via the descriptor
    Southbound,
    /// Values requested by northbound
    Northbound,
    /// Values as the scheduler believes they are applied
    Cached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Bridge {
        name: String,
    }

    #[test]
    fn value_equality_across_types() {
        let a = new_value(Bridge { name: "br0".into() });
        let b = new_value(Bridge { name: "br0".into() });
        let c = new_value("br0".to_string());
        assert!(a.equals(b.as_ref()));
        assert!(!a.equals(c.as_ref()));
        assert_eq!(value_as::<Bridge>(&a).map(|b| b.name.as_str()), Some("br0"));
        assert!(value_as::<String>(&a).is_none());
    }

    #[test]
    fn dependency_satisfaction() {
        let by_key = Dependency::on_key("bridge", "bd/br0");
        assert!(by_key.is_satisfied_by("bd/br0"));
        assert!(!by_key.is_satisfied_by("bd/br1"));

        let any = Dependency::any_of("some bridge", prefix_selector("bd/"));
        assert!(any.is_satisfied_by("bd/br1"));
        assert!(!any.is_satisfied_by("leaf/l1"));
    }
}
