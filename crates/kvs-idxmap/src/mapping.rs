//! In-memory name-to-index registry
//!
//! Provides [`NameToIdx`], a bidirectional mapping between names and numeric
//! indexes carrying arbitrary metadata.
//!
//! A single reader/writer lock guards the primary map together with all
//! secondary indexes, so lookups never observe a half-applied mutation.
//! Watchers are notified after the lock is released.

use crate::error::IdxMapError;
use crate::event::NameToIdxEvent;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn, Span};

/// Derives secondary index entries (`field -> values`) from metadata
pub type IndexFn<M> = Arc<dyn Fn(&M) -> HashMap<String, Vec<String>> + Send + Sync>;

type WatchCallback<M> = Arc<dyn Fn(NameToIdxEvent<M>) + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry<M> {
    idx: u32,
    metadata: M,
    /// Secondary index entries computed when the entry was stored
    fields: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct Indexes<M> {
    entries: HashMap<String, Entry<M>>,
    /// field -> value -> names
    by_field: HashMap<String, HashMap<String, BTreeSet<String>>>,
    /// idx -> names; more than one name per idx means a broken invariant
    by_idx: HashMap<u32, BTreeSet<String>>,
}

impl<M> Default for Indexes<M> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_field: HashMap::new(),
            by_idx: HashMap::new(),
        }
    }
}

impl<M> Indexes<M> {
    fn insert(&mut self, name: &str, entry: Entry<M>) -> Option<Entry<M>> {
        let previous = self.remove(name);
        for (field, values) in &entry.fields {
            let by_value = self.by_field.entry(field.clone()).or_default();
            for value in values {
                by_value.entry(value.clone()).or_default().insert(name.to_owned());
            }
        }
        self.by_idx.entry(entry.idx).or_default().insert(name.to_owned());
        self.entries.insert(name.to_owned(), entry);
        previous
    }

    fn remove(&mut self, name: &str) -> Option<Entry<M>> {
        let entry = self.entries.remove(name)?;
        for (field, values) in &entry.fields {
            if let Some(by_value) = self.by_field.get_mut(field) {
                for value in values {
                    if let Some(names) = by_value.get_mut(value) {
                        names.remove(name);
                        if names.is_empty() {
                            by_value.remove(value);
                        }
                    }
                }
                if by_value.is_empty() {
                    self.by_field.remove(field);
                }
            }
        }
        if let Some(names) = self.by_idx.get_mut(&entry.idx) {
            names.remove(name);
            if names.is_empty() {
                self.by_idx.remove(&entry.idx);
            }
        }
        Some(entry)
    }
}

/// Thread-safe registry mapping names to `(idx, metadata)`.
///
/// Names are unique; uniqueness of indexes is expected but not enforced.
/// Lookups by index fail closed when the index is ambiguous.
pub struct NameToIdx<M> {
    title: String,
    index_fn: Option<IndexFn<M>>,
    indexes: RwLock<Indexes<M>>,
    subscribers: DashMap<String, WatchCallback<M>>,
    span: Span,
}

impl<M> fmt::Debug for NameToIdx<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameToIdx")
            .field("title", &self.title)
            .field("len", &self.indexes.read().entries.len())
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl<M: Clone + Send + Sync + 'static> NameToIdx<M> {
    /// Create registry without secondary indexes
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self::build(title, None)
    }

    /// Create registry with secondary indexes derived by `index_fn`
    #[must_use]
    pub fn with_index<F>(title: &str, index_fn: F) -> Self
    where
        F: Fn(&M) -> HashMap<String, Vec<String>> + Send + Sync + 'static,
    {
        Self::build(title, Some(Arc::new(index_fn)))
    }

    fn build(title: &str, index_fn: Option<IndexFn<M>>) -> Self {
        Self {
            title: title.to_owned(),
            index_fn,
            indexes: RwLock::new(Indexes::default()),
            subscribers: DashMap::new(),
            span: tracing::debug_span!("name_to_idx", registry = %title),
        }
    }

    /// Registry title
    #[inline]
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    fn entry(&self, idx: u32, metadata: M) -> Entry<M> {
        let fields = self
            .index_fn
            .as_ref()
            .map(|index_fn| index_fn(&metadata))
            .unwrap_or_default();
        Entry { idx, metadata, fields }
    }

    /// Register `name` with `idx` and `metadata`.
    ///
    /// An existing registration of the same name is replaced, including its
    /// index and all secondary index entries.
    pub fn register_name(&self, name: &str, idx: u32, metadata: M) {
        let entry = self.entry(idx, metadata.clone());
        let previous = self.indexes.write().insert(name, entry);

        let mut event = NameToIdxEvent::new(&self.title, name, idx, metadata);
        event.update = previous.is_some();
        self.publish(&event);
    }

    /// Remove `name` from the registry, returning its index and metadata
    pub fn unregister_name(&self, name: &str) -> Option<(u32, M)> {
        let removed = self.indexes.write().remove(name)?;

        let mut event = NameToIdxEvent::new(&self.title, name, removed.idx, removed.metadata.clone());
        event.del = true;
        self.publish(&event);
        Some((removed.idx, removed.metadata))
    }

    /// Replace metadata of a registered name, keeping its index.
    ///
    /// Returns false if the name is not registered.
    pub fn update_metadata(&self, name: &str, metadata: M) -> bool {
        let idx = {
            let mut indexes = self.indexes.write();
            let Some(idx) = indexes.entries.get(name).map(|entry| entry.idx) else {
                return false;
            };
            let entry = self.entry(idx, metadata.clone());
            indexes.insert(name, entry);
            idx
        };

        let mut event = NameToIdxEvent::new(&self.title, name, idx, metadata);
        event.update = true;
        self.publish(&event);
        true
    }

    /// Index and metadata registered under `name`
    #[must_use]
    pub fn lookup_idx(&self, name: &str) -> Option<(u32, M)> {
        let indexes = self.indexes.read();
        indexes
            .entries
            .get(name)
            .map(|entry| (entry.idx, entry.metadata.clone()))
    }

    /// Name and metadata registered under `idx`.
    ///
    /// Returns `None` if no name or more than one name maps to `idx`.
    #[must_use]
    pub fn lookup_name(&self, idx: u32) -> Option<(String, M)> {
        let indexes = self.indexes.read();
        let names = indexes.by_idx.get(&idx)?;
        if names.len() > 1 {
            let _enter = self.span.enter();
            warn!(idx, names = ?names, "Index is registered under multiple names");
            return None;
        }
        let name = names.first()?;
        let entry = indexes.entries.get(name)?;
        Some((name.clone(), entry.metadata.clone()))
    }

    /// Names whose metadata has `value` under the secondary index `field`, sorted
    #[must_use]
    pub fn lookup_name_by_metadata(&self, field: &str, value: &str) -> Vec<String> {
        let indexes = self.indexes.read();
        indexes
            .by_field
            .get(field)
            .and_then(|by_value| by_value.get(value))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Secondary index entries of `name`
    #[must_use]
    pub fn list_fields(&self, name: &str) -> HashMap<String, Vec<String>> {
        let indexes = self.indexes.read();
        indexes
            .entries
            .get(name)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default()
    }

    /// All registered names, sorted
    #[must_use]
    pub fn list_names(&self) -> Vec<String> {
        let indexes = self.indexes.read();
        let mut names: Vec<String> = indexes.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered names
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.read().entries.len()
    }

    /// True if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registration; watchers receive a delete event per name
    pub fn clear(&self) {
        let removed = {
            let mut indexes = self.indexes.write();
            std::mem::take(&mut *indexes).entries
        };
        let mut names: Vec<_> = removed.into_iter().collect();
        names.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (name, entry) in names {
            let mut event = NameToIdxEvent::new(&self.title, &name, entry.idx, entry.metadata);
            event.del = true;
            self.publish(&event);
        }
    }

    /// Subscribe `callback` to every subsequent mutation.
    ///
    /// The callback runs synchronously in the mutator's call path; wrap a
    /// channel with [`to_chan`](crate::to_chan) for asynchronous delivery.
    ///
    /// # Errors
    /// Returns error if `subscriber` already watches this registry
    pub fn watch<F>(&self, subscriber: &str, callback: F) -> Result<(), IdxMapError>
    where
        F: Fn(NameToIdxEvent<M>) + Send + Sync + 'static,
    {
        match self.subscribers.entry(subscriber.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(IdxMapError::DuplicateSubscriber {
                registry: self.title.clone(),
                subscriber: subscriber.to_owned(),
            }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(callback));
                Ok(())
            }
        }
    }

    fn publish(&self, event: &NameToIdxEvent<M>) {
        let callbacks: Vec<(String, WatchCallback<M>)> = self
            .subscribers
            .iter()
            .map(|sub| (sub.key().clone(), Arc::clone(sub.value())))
            .collect();
        let _enter = self.span.enter();
        for (subscriber, callback) in callbacks {
            debug!(
                subscriber = %subscriber,
                name = %event.name,
                idx = event.idx,
                del = event.is_delete(),
                "Publishing mapping change"
            );
            callback(event.clone());
        }
    }
}
