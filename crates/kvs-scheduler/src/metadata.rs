//! Per-descriptor metadata maps
//!
//! Descriptors which keep metadata get a map from key label to metadata.
//! The default map is backed by [`NameToIdx`], assigning every label a
//! local index and supporting secondary indexes over the metadata.

use crate::api::Metadata;
use kvs_idxmap::{IdxMapError, NameToIdx, NameToIdxEvent};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Map of metadata keyed by value label
pub trait MetadataMap: Send + Sync + fmt::Debug {
    /// Store metadata under `label`, replacing any previous entry
    fn put(&self, label: &str, metadata: Metadata);

    /// Remove metadata stored under `label`
    fn delete(&self, label: &str) -> Option<Metadata>;

    /// Metadata stored under `label`
    fn get(&self, label: &str) -> Option<Metadata>;

    /// All labels, sorted
    fn list_names(&self) -> Vec<String>;

    /// Access to the concrete map type
    fn as_any(&self) -> &dyn Any;
}

/// Extracts a preferred index from metadata
pub type IdxFn = Arc<dyn Fn(&Metadata) -> Option<u32> + Send + Sync>;

/// [`MetadataMap`] backed by a [`NameToIdx`] registry.
///
/// Labels get the index returned by the optional index function, otherwise
/// they keep their previous index or take the next local sequence number.
pub struct IndexedMetadataMap {
    mapping: NameToIdx<Metadata>,
    next_idx: AtomicU32,
    idx_fn: Option<IdxFn>,
}

impl IndexedMetadataMap {
    /// Create map without secondary indexes
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self::from_mapping(NameToIdx::new(title))
    }

    /// Create map with secondary indexes derived from metadata
    #[must_use]
    pub fn with_index<F>(title: &str, index_fn: F) -> Self
    where
        F: Fn(&Metadata) -> HashMap<String, Vec<String>> + Send + Sync + 'static,
    {
        Self::from_mapping(NameToIdx::with_index(title, index_fn))
    }

    fn from_mapping(mapping: NameToIdx<Metadata>) -> Self {
        Self {
            mapping,
            next_idx: AtomicU32::new(1),
            idx_fn: None,
        }
    }

    /// Take indexes from metadata instead of the local sequence
    #[must_use]
    pub fn with_idx_fn<F>(mut self, idx_fn: F) -> Self
    where
        F: Fn(&Metadata) -> Option<u32> + Send + Sync + 'static,
    {
        self.idx_fn = Some(Arc::new(idx_fn));
        self
    }

    /// Underlying registry
    #[inline]
    #[must_use]
    pub fn mapping(&self) -> &NameToIdx<Metadata> {
        &self.mapping
    }

    /// Index and metadata of `label`
    #[must_use]
    pub fn lookup_idx(&self, label: &str) -> Option<(u32, Metadata)> {
        self.mapping.lookup_idx(label)
    }

    /// Label and metadata registered under `idx`
    #[must_use]
    pub fn lookup_name(&self, idx: u32) -> Option<(String, Metadata)> {
        self.mapping.lookup_name(idx)
    }

    /// Labels whose metadata has `value` under secondary index `field`
    #[must_use]
    pub fn lookup_by_metadata(&self, field: &str, value: &str) -> Vec<String> {
        self.mapping.lookup_name_by_metadata(field, value)
    }

    /// Watch changes of the map
    ///
    /// # Errors
    /// Returns error if `subscriber` already watches this map
    pub fn watch<F>(&self, subscriber: &str, callback: F) -> Result<(), IdxMapError>
    where
        F: Fn(NameToIdxEvent<Metadata>) + Send + Sync + 'static,
    {
        self.mapping.watch(subscriber, callback)
    }
}

impl MetadataMap for IndexedMetadataMap {
    fn put(&self, label: &str, metadata: Metadata) {
        let idx = self
            .idx_fn
            .as_ref()
            .and_then(|idx_fn| idx_fn(&metadata))
            .or_else(|| self.mapping.lookup_idx(label).map(|(idx, _)| idx))
            .unwrap_or_else(|| self.next_idx.fetch_add(1, Ordering::Relaxed));
        self.mapping.register_name(label, idx, metadata);
    }

    fn delete(&self, label: &str) -> Option<Metadata> {
        self.mapping.unregister_name(label).map(|(_, metadata)| metadata)
    }

    fn get(&self, label: &str) -> Option<Metadata> {
        self.mapping.lookup_idx(label).map(|(_, metadata)| metadata)
    }

    fn list_names(&self) -> Vec<String> {
        self.mapping.list_names()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for IndexedMetadataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedMetadataMap")
            .field("mapping", &self.mapping)
            .field("next_idx", &self.next_idx.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{metadata_as, new_metadata};

    #[derive(Debug)]
    struct IfaceMeta {
        sw_if_index: u32,
        vrf: u32,
    }

    #[test]
    fn metadata_map_assigns_local_sequence() {
        let map = IndexedMetadataMap::new("bridges");
        map.put("br0", new_metadata(()));
        map.put("br1", new_metadata(()));
        map.put("br0", new_metadata(()));
        assert_eq!(map.lookup_idx("br0").map(|(idx, _)| idx), Some(1));
        assert_eq!(map.lookup_idx("br1").map(|(idx, _)| idx), Some(2));
        assert_eq!(map.list_names(), ["br0", "br1"]);

        assert!(map.delete("br0").is_some());
        assert!(map.get("br0").is_none());
    }

    #[test]
    fn metadata_map_with_idx_and_secondary_index() {
        let map = IndexedMetadataMap::with_index("interfaces", |meta: &Metadata| {
            metadata_as::<IfaceMeta>(meta)
                .map(|m| HashMap::from([("vrf".to_string(), vec![m.vrf.to_string()])]))
                .unwrap_or_default()
        })
        .with_idx_fn(|meta| metadata_as::<IfaceMeta>(meta).map(|m| m.sw_if_index));

        map.put("eth0", new_metadata(IfaceMeta { sw_if_index: 7, vrf: 1 }));
        map.put("eth1", new_metadata(IfaceMeta { sw_if_index: 9, vrf: 1 }));

        let (name, meta) = map.lookup_name(7).unwrap();
        assert_eq!(name, "eth0");
        assert_eq!(metadata_as::<IfaceMeta>(&meta).map(|m| m.vrf), Some(1));
        assert_eq!(map.lookup_by_metadata("vrf", "1"), ["eth0", "eth1"]);
    }
}
