//! Descriptor contract implemented by domain plugins
//!
//! A descriptor owns a class of keys (selected by [`KvDescriptor::key_selector`])
//! and implements the CRUD, dependency and dump callbacks for them. Only the
//! name and the key selector are mandatory; every other callback has a
//! default describing a value with no backend side effects.

use crate::api::{Dependency, KeyValuePair, KvWithMetadata, Metadata, Value};
use crate::metadata::{IndexedMetadataMap, MetadataMap};
use std::sync::Arc;

/// Descriptor of a class of key-value pairs.
///
/// Callbacks are synchronous and expected to be fast; the scheduler calls
/// them from within its transaction critical section.
pub trait KvDescriptor: Send + Sync {
    /// Unique descriptor name
    fn name(&self) -> &str;

    /// True if the descriptor owns `key`
    fn key_selector(&self, key: &str) -> bool;

    /// Prefix of northbound keys owned by this descriptor
    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    /// Short label of the key, used in the metadata map
    fn key_label(&self, key: &str) -> String {
        key.to_owned()
    }

    /// Name of the value type, informational
    fn value_type_name(&self) -> &str {
        ""
    }

    /// True if the two values are equivalent and no modification is needed
    fn equivalent_values(&self, _key: &str, old_value: &Value, new_value: &Value) -> bool {
        old_value.equals(new_value.as_ref())
    }

    /// True if the descriptor keeps metadata for its values
    fn with_metadata(&self) -> bool {
        false
    }

    /// Create the map storing metadata of this descriptor's values
    fn metadata_map_factory(&self) -> Arc<dyn MetadataMap> {
        Arc::new(IndexedMetadataMap::new(self.name()))
    }

    /// Validate value before it is applied
    ///
    /// # Errors
    /// Returns [`InvalidValueError`](crate::InvalidValueError) (possibly
    /// wrapped) if the value cannot be applied
    fn validate(&self, _key: &str, _value: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Create the value in southbound
    ///
    /// # Errors
    /// Returns error if the backend rejects the value
    fn add(&self, _key: &str, _value: &Value) -> anyhow::Result<Option<Metadata>> {
        Ok(None)
    }

    /// Update the value in place
    ///
    /// # Errors
    /// Returns error if the backend rejects the update
    fn modify(
        &self,
        _key: &str,
        _old_value: &Value,
        _new_value: &Value,
        old_metadata: Option<&Metadata>,
    ) -> anyhow::Result<Option<Metadata>> {
        Ok(old_metadata.cloned())
    }

    /// Remove the value from southbound
    ///
    /// # Errors
    /// Returns error if the backend fails to remove the value
    fn delete(&self, _key: &str, _value: &Value, _metadata: Option<&Metadata>) -> anyhow::Result<()> {
        Ok(())
    }

    /// True if the update must be done as delete followed by add
    fn modify_with_recreate(
        &self,
        _key: &str,
        _old_value: &Value,
        _new_value: &Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        false
    }

    /// True if the failed operation is worth retrying
    fn is_retriable_failure(&self, _err: &anyhow::Error) -> bool {
        true
    }

    /// Values implied by this value
    fn derived_values(&self, _key: &str, _value: &Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Values which must exist before this value is created
    fn dependencies(&self, _key: &str, _value: &Value) -> Vec<Dependency> {
        Vec::new()
    }

    /// True if [`KvDescriptor::dump`] reads the southbound state
    fn is_dumpable(&self) -> bool {
        false
    }

    /// Read values of this descriptor from southbound.
    ///
    /// `correlate` carries the values the scheduler expects to find, to help
    /// resolving origins and metadata.
    ///
    /// # Errors
    /// Returns error if southbound cannot be read
    fn dump(&self, _correlate: &[KvWithMetadata]) -> anyhow::Result<Vec<KvWithMetadata>> {
        Ok(Vec::new())
    }

    /// Descriptors to dump before this one
    fn dump_dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

impl std::fmt::Debug for dyn KvDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDescriptor")
            .field("name", &self.name())
            .field("nb_key_prefix", &self.nb_key_prefix())
            .field("with_metadata", &self.with_metadata())
            .finish_non_exhaustive()
    }
}
