//! In-memory southbound with bridge and leaf descriptors
//!
//! The southbound enforces the same constraints a real data plane would: a
//! leaf can only be created on an existing bridge and a bridge with leaves
//! cannot be removed. Mis-ordered operations therefore fail loudly.

use crate::api::{new_metadata, new_value, value_as, Dependency, KeyValuePair, KvWithMetadata, Metadata, Value};
use crate::descriptor::KvDescriptor;
use crate::error::InvalidValueError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Key prefix of bridges
pub const BRIDGE_PREFIX: &str = "bridge/";
/// Key prefix of leaves
pub const LEAF_PREFIX: &str = "leaf/";
/// Key prefix of the derived STP property of bridges
pub const STP_PREFIX: &str = "stp/";

/// Key of the bridge with the given name
#[must_use]
pub fn bridge_key(name: &str) -> String {
    format!("{BRIDGE_PREFIX}{name}")
}

/// Key of the leaf with the given name
#[must_use]
pub fn leaf_key(name: &str) -> String {
    format!("{LEAF_PREFIX}{name}")
}

/// Bridge value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bridge {
    /// Bridge name
    pub name: String,
    /// MTU, at least 576
    pub mtu: u32,
    /// Spanning tree enabled
    pub stp: bool,
}

impl Bridge {
    /// Bridge with default MTU and STP off
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            mtu: 1500,
            stp: false,
        }
    }
}

/// Leaf attached to a bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leaf {
    /// Leaf name
    pub name: String,
    /// Name of the bridge the leaf is attached to
    pub bridge: String,
    /// VLAN tag
    pub vlan: u16,
}

impl Leaf {
    /// Leaf attached to `bridge`
    #[must_use]
    pub fn new(name: &str, bridge: &str) -> Self {
        Self {
            name: name.to_owned(),
            bridge: bridge.to_owned(),
            vlan: 0,
        }
    }
}

/// Index assigned by the southbound to every created object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbIndex(pub u32);

/// Southbound failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SouthboundError {
    /// Transient failure injected by a test
    #[error("injected failure for {0}")]
    Injected(String),
    /// Permanent failure injected by a test
    #[error("permanent failure for {0}")]
    Permanent(String),
    /// Object already exists
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Object does not exist
    #[error("{0} does not exist")]
    NotFound(String),
    /// Object requires another object which does not exist
    #[error("{key} requires {requires}")]
    MissingDependency {
        /// Object being created
        key: String,
        /// Missing object
        requires: String,
    },
    /// Object is still used by others
    #[error("{0} is in use")]
    InUse(String),
    /// Dump not possible
    #[error("southbound unreachable")]
    Unreachable,
}

impl SouthboundError {
    /// True if the failure may go away on retry
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    index: u32,
    requires: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Injection {
    remaining: u32,
    permanent: bool,
}

/// Recording in-memory southbound
#[derive(Debug, Default)]
pub struct MemorySouthbound {
    entries: Mutex<BTreeMap<String, Entry>>,
    log: Mutex<Vec<String>>,
    injections: Mutex<HashMap<String, Injection>>,
    unreachable: Mutex<bool>,
    next_index: Mutex<u32>,
}

impl MemorySouthbound {
    /// Create empty southbound
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` operations on `key` with a transient error
    pub fn fail_next(&self, key: &str, times: u32) {
        self.injections.lock().insert(
            key.to_owned(),
            Injection {
                remaining: times,
                permanent: false,
            },
        );
    }

    /// Fail every operation on `key` with a permanent error
    pub fn fail_permanently(&self, key: &str) {
        self.injections.lock().insert(
            key.to_owned(),
            Injection {
                remaining: u32::MAX,
                permanent: true,
            },
        );
    }

    /// Make dumps fail
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    /// Operations executed so far, e.g. `create bridge/br0`
    #[must_use]
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Forget recorded operations
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Keys of all objects
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// True if the object exists
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Value of the object
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// Create object behind the scheduler's back
    pub fn insert_external(&self, key: &str, value: Value) {
        let index = self.allocate_index();
        self.entries.lock().insert(
            key.to_owned(),
            Entry {
                value,
                index,
                requires: None,
            },
        );
    }

    /// Remove object behind the scheduler's back
    pub fn remove_external(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    fn allocate_index(&self) -> u32 {
        let mut next = self.next_index.lock();
        *next += 1;
        *next
    }

    fn check_injection(&self, key: &str) -> Result<(), SouthboundError> {
        let mut injections = self.injections.lock();
        let Some(injection) = injections.get_mut(key) else {
            return Ok(());
        };
        if injection.permanent {
            return Err(SouthboundError::Permanent(key.to_owned()));
        }
        injection.remaining = injection.remaining.saturating_sub(1);
        if injection.remaining == 0 {
            injections.remove(key);
        }
        Err(SouthboundError::Injected(key.to_owned()))
    }

    /// Create object, returning its index
    ///
    /// # Errors
    /// Returns error if the object exists, its dependency is missing or a
    /// failure is injected
    pub fn create(&self, key: &str, value: Value, requires: Option<&str>) -> Result<u32, SouthboundError> {
        self.log.lock().push(format!("create {key}"));
        self.check_injection(key)?;
        let index = self.allocate_index();
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(SouthboundError::AlreadyExists(key.to_owned()));
        }
        if let Some(requires) = requires {
            if !entries.contains_key(requires) {
                return Err(SouthboundError::MissingDependency {
                    key: key.to_owned(),
                    requires: requires.to_owned(),
                });
            }
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                index,
                requires: requires.map(str::to_owned),
            },
        );
        Ok(index)
    }

    /// Update object in place
    ///
    /// # Errors
    /// Returns error if the object does not exist or a failure is injected
    pub fn update(&self, key: &str, value: Value) -> Result<u32, SouthboundError> {
        self.log.lock().push(format!("update {key}"));
        self.check_injection(key)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SouthboundError::NotFound(key.to_owned()))?;
        entry.value = value;
        Ok(entry.index)
    }

    /// Remove object
    ///
    /// # Errors
    /// Returns error if the object does not exist, other objects require it
    /// or a failure is injected
    pub fn remove(&self, key: &str) -> Result<(), SouthboundError> {
        self.log.lock().push(format!("remove {key}"));
        self.check_injection(key)?;
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Err(SouthboundError::NotFound(key.to_owned()));
        }
        if entries
            .values()
            .any(|entry| entry.requires.as_deref() == Some(key))
        {
            return Err(SouthboundError::InUse(key.to_owned()));
        }
        entries.remove(key);
        Ok(())
    }

    /// Objects with the given key prefix
    ///
    /// # Errors
    /// Returns error while the southbound is unreachable
    pub fn dump(&self, prefix: &str) -> Result<Vec<KvWithMetadata>, SouthboundError> {
        if *self.unreachable.lock() {
            return Err(SouthboundError::Unreachable);
        }
        Ok(self
            .entries
            .lock()
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KvWithMetadata {
                key: key.clone(),
                value: Arc::clone(&entry.value),
                metadata: Some(new_metadata(SbIndex(entry.index))),
                origin: crate::api::ValueOrigin::Unknown,
            })
            .collect())
    }
}

fn is_retriable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SouthboundError>()
        .map_or(true, SouthboundError::is_retriable)
}

fn index_metadata(index: u32) -> Option<Metadata> {
    Some(new_metadata(SbIndex(index)))
}

/// Descriptor of [`Bridge`] values; toggling spanning tree recreates the
/// bridge
#[derive(Debug)]
pub struct BridgeDescriptor {
    southbound: Arc<MemorySouthbound>,
}

impl BridgeDescriptor {
    /// Descriptor backed by `southbound`
    #[must_use]
    pub fn new(southbound: Arc<MemorySouthbound>) -> Arc<Self> {
        Arc::new(Self { southbound })
    }
}

impl KvDescriptor for BridgeDescriptor {
    fn name(&self) -> &str {
        "bridge"
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(BRIDGE_PREFIX)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(BRIDGE_PREFIX)
    }

    fn key_label(&self, key: &str) -> String {
        key.trim_start_matches(BRIDGE_PREFIX).to_owned()
    }

    fn value_type_name(&self) -> &str {
        "Bridge"
    }

    fn with_metadata(&self) -> bool {
        true
    }

    fn validate(&self, _key: &str, value: &Value) -> anyhow::Result<()> {
        let bridge = value_as::<Bridge>(value)
            .ok_or_else(|| InvalidValueError::new("not a bridge", Vec::<String>::new()))?;
        if bridge.name.is_empty() {
            return Err(InvalidValueError::new("bridge without name", ["name"]).into());
        }
        if bridge.mtu < 576 {
            return Err(InvalidValueError::new(format!("mtu {} too small", bridge.mtu), ["mtu"]).into());
        }
        Ok(())
    }

    fn add(&self, key: &str, value: &Value) -> anyhow::Result<Option<Metadata>> {
        let index = self.southbound.create(key, Arc::clone(value), None)?;
        Ok(index_metadata(index))
    }

    fn modify(
        &self,
        key: &str,
        _old_value: &Value,
        new_value: &Value,
        _old_metadata: Option<&Metadata>,
    ) -> anyhow::Result<Option<Metadata>> {
        let index = self.southbound.update(key, Arc::clone(new_value))?;
        Ok(index_metadata(index))
    }

    fn delete(&self, key: &str, _value: &Value, _metadata: Option<&Metadata>) -> anyhow::Result<()> {
        Ok(self.southbound.remove(key)?)
    }

    fn modify_with_recreate(
        &self,
        _key: &str,
        old_value: &Value,
        new_value: &Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        match (value_as::<Bridge>(old_value), value_as::<Bridge>(new_value)) {
            (Some(old), Some(new)) => old.stp != new.stp,
            _ => true,
        }
    }

    fn is_retriable_failure(&self, err: &anyhow::Error) -> bool {
        is_retriable(err)
    }

    fn derived_values(&self, _key: &str, value: &Value) -> Vec<KeyValuePair> {
        value_as::<Bridge>(value)
            .filter(|bridge| bridge.stp)
            .map(|bridge| KeyValuePair::new(format!("{STP_PREFIX}{}", bridge.name), new_value(true)))
            .into_iter()
            .collect()
    }

    fn is_dumpable(&self) -> bool {
        true
    }

    fn dump(&self, _correlate: &[KvWithMetadata]) -> anyhow::Result<Vec<KvWithMetadata>> {
        Ok(self.southbound.dump(BRIDGE_PREFIX)?)
    }
}

/// Descriptor of [`Leaf`] values; a leaf depends on its bridge and moving it
/// to another bridge recreates it
#[derive(Debug)]
pub struct LeafDescriptor {
    southbound: Arc<MemorySouthbound>,
}

impl LeafDescriptor {
    /// Descriptor backed by `southbound`
    #[must_use]
    pub fn new(southbound: Arc<MemorySouthbound>) -> Arc<Self> {
        Arc::new(Self { southbound })
    }
}

impl KvDescriptor for LeafDescriptor {
    fn name(&self) -> &str {
        "leaf"
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(LEAF_PREFIX)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(LEAF_PREFIX)
    }

    fn value_type_name(&self) -> &str {
        "Leaf"
    }

    fn validate(&self, _key: &str, value: &Value) -> anyhow::Result<()> {
        match value_as::<Leaf>(value) {
            Some(leaf) if leaf.bridge.is_empty() => {
                Err(InvalidValueError::new("leaf without bridge", ["bridge"]).into())
            }
            Some(leaf) if leaf.vlan > 4094 => {
                Err(InvalidValueError::new(format!("vlan {} out of range", leaf.vlan), ["vlan"]).into())
            }
            Some(_) => Ok(()),
            None => Err(InvalidValueError::new("not a leaf", Vec::<String>::new()).into()),
        }
    }

    fn add(&self, key: &str, value: &Value) -> anyhow::Result<Option<Metadata>> {
        let requires = value_as::<Leaf>(value).map(|leaf| bridge_key(&leaf.bridge));
        self.southbound
            .create(key, Arc::clone(value), requires.as_deref())?;
        Ok(None)
    }

    fn modify(
        &self,
        key: &str,
        _old_value: &Value,
        new_value: &Value,
        old_metadata: Option<&Metadata>,
    ) -> anyhow::Result<Option<Metadata>> {
        self.southbound.update(key, Arc::clone(new_value))?;
        Ok(old_metadata.cloned())
    }

    fn delete(&self, key: &str, _value: &Value, _metadata: Option<&Metadata>) -> anyhow::Result<()> {
        Ok(self.southbound.remove(key)?)
    }

    fn modify_with_recreate(
        &self,
        _key: &str,
        old_value: &Value,
        new_value: &Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        match (value_as::<Leaf>(old_value), value_as::<Leaf>(new_value)) {
            (Some(old), Some(new)) => old.bridge != new.bridge,
            _ => true,
        }
    }

    fn is_retriable_failure(&self, err: &anyhow::Error) -> bool {
        is_retriable(err)
    }

    fn dependencies(&self, _key: &str, value: &Value) -> Vec<Dependency> {
        value_as::<Leaf>(value)
            .map(|leaf| vec![Dependency::on_key("bridge", bridge_key(&leaf.bridge))])
            .unwrap_or_default()
    }

    fn is_dumpable(&self) -> bool {
        true
    }

    fn dump(&self, _correlate: &[KvWithMetadata]) -> anyhow::Result<Vec<KvWithMetadata>> {
        let mut values = self.southbound.dump(LEAF_PREFIX)?;
        for kv in &mut values {
            kv.metadata = None;
        }
        Ok(values)
    }

    fn dump_dependencies(&self) -> Vec<String> {
        vec!["bridge".to_owned()]
    }
}
