//! Registry of descriptors
//!
//! Keeps descriptors in dump order: every descriptor comes after the
//! descriptors listed in its dump dependencies.

use crate::descriptor::KvDescriptor;
use crate::error::SchedulerError;
use crate::metadata::MetadataMap;
use kvs_keyset::{topological_order, KeyDeps, KeySet, SliceKeySet};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registered descriptors with their metadata maps
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    /// Descriptors in registration order, used for key lookups
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    /// Descriptor names in dump order
    dump_order: Vec<String>,
    metadata_maps: HashMap<String, Arc<dyn MetadataMap>>,
}

impl DescriptorRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register descriptor.
    ///
    /// # Errors
    /// Returns error if a descriptor with the same name exists or if the
    /// dump dependencies would form a cycle
    pub fn register(&mut self, descriptor: Arc<dyn KvDescriptor>) -> Result<(), SchedulerError> {
        let name = descriptor.name().to_owned();
        if self.get(&name).is_some() {
            return Err(SchedulerError::DuplicateDescriptor(name));
        }

        let mut candidates = self.descriptors.clone();
        candidates.push(Arc::clone(&descriptor));
        let dump_order = Self::dump_order(&candidates)?;

        if descriptor.with_metadata() {
            self.metadata_maps
                .insert(name.clone(), descriptor.metadata_map_factory());
        }
        self.descriptors = candidates;
        self.dump_order = dump_order;
        debug!(descriptor = %name, dump_order = ?self.dump_order, "Registered descriptor");
        Ok(())
    }

    fn dump_order(descriptors: &[Arc<dyn KvDescriptor>]) -> Result<Vec<String>, SchedulerError> {
        let names = SliceKeySet::new(descriptors.iter().map(|d| d.name()));
        let deps: KeyDeps = descriptors
            .iter()
            .map(|d| {
                let deps: Box<dyn KeySet> = Box::new(SliceKeySet::new(d.dump_dependencies()));
                (d.name().to_owned(), deps)
            })
            .collect();
        Ok(topological_order(&names, &deps, true, false)?)
    }

    /// Descriptor registered under `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.name() == name)
            .map(Arc::clone)
    }

    /// First registered descriptor owning `key`
    #[must_use]
    pub fn for_key(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.key_selector(key))
            .map(Arc::clone)
    }

    /// Descriptors in dump order
    #[must_use]
    pub fn in_dump_order(&self) -> Vec<Arc<dyn KvDescriptor>> {
        self.dump_order
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    /// Metadata map of the descriptor
    #[must_use]
    pub fn metadata_map(&self, descriptor: &str) -> Option<Arc<dyn MetadataMap>> {
        self.metadata_maps.get(descriptor).map(Arc::clone)
    }

    /// Northbound key prefixes of all descriptors, in registration order
    #[must_use]
    pub fn nb_key_prefixes(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter_map(|d| d.nb_key_prefix().map(str::to_owned))
            .collect()
    }

    /// Number of registered descriptors
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True if no descriptor is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
