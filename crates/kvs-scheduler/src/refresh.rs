//! Refresh of the graph from southbound dumps

use crate::api::{KvWithMetadata, Metadata, Value, ValueOrigin, ValueState};
use crate::descriptor::KvDescriptor;
use crate::error::SchedulerError;
use crate::graph::Graph;
use crate::registry::DescriptorRegistry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Re-read every dumpable descriptor, in dump order.
///
/// `nb_values` carries the desired values of the first resync; they resolve
/// origins of dumped values before the graph knows anything. Later
/// refreshes correlate with the graph instead. A failed dump leaves the
/// descriptor's values untouched and is returned as
/// [`SchedulerError::DumpFailed`].
pub(crate) fn refresh(
    registry: &DescriptorRegistry,
    graph: &mut Graph,
    nb_values: Option<&BTreeMap<String, Value>>,
) -> Vec<SchedulerError> {
    let mut failures = Vec::new();
    for descriptor in registry.in_dump_order() {
        if !descriptor.is_dumpable() {
            continue;
        }
        let name = descriptor.name().to_owned();
        let correlate = correlate(descriptor.as_ref(), graph, nb_values);
        let dumped = match descriptor.dump(&correlate) {
            Ok(dumped) => dumped,
            Err(err) => {
                warn!(descriptor = %name, error = %err, "Dump failed, keeping values as they are");
                failures.push(SchedulerError::DumpFailed {
                    descriptor: name,
                    error: Arc::new(err),
                });
                continue;
            }
        };

        let mut seen = HashSet::new();
        for kv in dumped {
            if kv.key.is_empty() {
                warn!(descriptor = %name, "Dumped value with empty key, skipping");
                continue;
            }
            if !descriptor.key_selector(&kv.key) {
                warn!(descriptor = %name, key = %kv.key, "Dumped key not owned by descriptor, skipping");
                continue;
            }
            if !seen.insert(kv.key.clone()) {
                warn!(descriptor = %name, key = %kv.key, "Key dumped twice, skipping");
                continue;
            }
            let origin = resolve_origin(&kv, graph, nb_values);
            store_dumped(registry, graph, &descriptor, kv, origin);
        }

        let vanished: Vec<String> = graph
            .present()
            .filter(|node| {
                node.derived_from.is_none()
                    && node.descriptor.as_deref() == Some(name.as_str())
                    && !seen.contains(&node.key)
            })
            .map(|node| node.key.clone())
            .collect();
        for key in vanished {
            debug!(descriptor = %name, key = %key, "Value missing in southbound");
            sync_metadata(registry, descriptor.as_ref(), &key, None);
            drop_value(graph, &key);
        }
        info!(descriptor = %name, values = seen.len(), "Refreshed descriptor");
    }
    failures
}

pub(crate) fn correlate(
    descriptor: &dyn KvDescriptor,
    graph: &Graph,
    nb_values: Option<&BTreeMap<String, Value>>,
) -> Vec<KvWithMetadata> {
    if let Some(nb_values) = nb_values {
        return nb_values
            .iter()
            .filter(|(key, _)| descriptor.key_selector(key))
            .map(|(key, value)| KvWithMetadata {
                key: key.clone(),
                value: Arc::clone(value),
                metadata: None,
                origin: ValueOrigin::FromNb,
            })
            .collect();
    }
    graph
        .present()
        .filter(|node| {
            node.derived_from.is_none() && node.descriptor.as_deref() == Some(descriptor.name())
        })
        .filter_map(|node| {
            node.value.as_ref().map(|value| KvWithMetadata {
                key: node.key.clone(),
                value: Arc::clone(value),
                metadata: node.metadata.clone(),
                origin: node.origin,
            })
        })
        .collect()
}

fn resolve_origin(
    kv: &KvWithMetadata,
    graph: &Graph,
    nb_values: Option<&BTreeMap<String, Value>>,
) -> ValueOrigin {
    if kv.origin != ValueOrigin::Unknown {
        return kv.origin;
    }
    if let Some(node) = graph.get(&kv.key) {
        if node.origin != ValueOrigin::Unknown {
            return node.origin;
        }
    }
    if nb_values.is_some_and(|nb| nb.contains_key(&kv.key)) {
        return ValueOrigin::FromNb;
    }
    ValueOrigin::FromSb
}

fn store_dumped(
    registry: &DescriptorRegistry,
    graph: &mut Graph,
    descriptor: &Arc<dyn KvDescriptor>,
    kv: KvWithMetadata,
    origin: ValueOrigin,
) {
    sync_metadata(registry, descriptor.as_ref(), &kv.key, kv.metadata.as_ref());
    store_value(
        registry,
        graph,
        &kv.key,
        kv.value,
        kv.metadata,
        Some(descriptor),
        origin,
    );
}

/// Mirror the metadata of `key` into the descriptor's metadata map
pub(crate) fn sync_metadata(
    registry: &DescriptorRegistry,
    descriptor: &dyn KvDescriptor,
    key: &str,
    metadata: Option<&Metadata>,
) {
    if !descriptor.with_metadata() {
        return;
    }
    let Some(map) = registry.metadata_map(descriptor.name()) else {
        return;
    };
    let label = descriptor.key_label(key);
    match metadata {
        Some(metadata) => map.put(&label, Arc::clone(metadata)),
        None => {
            map.delete(&label);
        }
    }
}

/// Store a value observed in southbound and re-derive its derived values
pub(crate) fn store_value(
    registry: &DescriptorRegistry,
    graph: &mut Graph,
    key: &str,
    value: Value,
    metadata: Option<Metadata>,
    descriptor: Option<&Arc<dyn KvDescriptor>>,
    origin: ValueOrigin,
) {
    let deps = descriptor.map_or_else(Vec::new, |d| d.dependencies(key, &value));
    let derived = descriptor.map_or_else(Vec::new, |d| d.derived_values(key, &value));

    let node = graph.node_mut(key);
    node.value = Some(value);
    node.metadata = metadata;
    node.origin = origin;
    node.state = match origin {
        ValueOrigin::FromSb => ValueState::Retrieved,
        _ => ValueState::Configured,
    };
    node.descriptor = descriptor.map(|d| d.name().to_owned());
    node.deps = deps;
    node.details.clear();

    let derived_keys: HashSet<&str> = derived.iter().map(|kv| kv.key.as_str()).collect();
    for old in graph.derived_of(key) {
        if !derived_keys.contains(old.as_str()) {
            drop_value(graph, &old);
        }
    }
    for kv in derived {
        let collides = graph
            .get(&kv.key)
            .is_some_and(|node| node.is_present() && node.derived_from.as_deref() != Some(key));
        if collides {
            warn!(key = %kv.key, base = %key, "Derived key collides with another value, skipping");
            continue;
        }
        let desc = registry.for_key(&kv.key);
        store_value(registry, graph, &kv.key, kv.value, None, desc.as_ref(), origin);
        if let Some(node) = graph.get_mut(&kv.key) {
            node.derived_from = Some(key.to_owned());
        }
    }
}

/// Forget a value which is no longer in southbound, with its derived values.
///
/// Southbound-only values disappear entirely; northbound values stay known
/// so they get re-created.
pub(crate) fn drop_value(graph: &mut Graph, key: &str) {
    for derived in graph.derived_of(key) {
        drop_value(graph, &derived);
    }
    let Some(node) = graph.get_mut(key) else {
        return;
    };
    if node.origin == ValueOrigin::FromSb {
        graph.remove(key);
        return;
    }
    node.value = None;
    node.metadata = None;
    node.deps.clear();
    node.state = ValueState::NonExistent;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{new_value, KeyValuePair};
    use parking_lot::Mutex;

    struct Dumper {
        values: Mutex<anyhow::Result<Vec<KvWithMetadata>>>,
    }

    impl Dumper {
        fn new(keys: &[&str]) -> Self {
            let values = keys
                .iter()
                .map(|key| KvWithMetadata {
                    key: (*key).to_string(),
                    value: new_value(1u32),
                    metadata: None,
                    origin: ValueOrigin::Unknown,
                })
                .collect();
            Self {
                values: Mutex::new(Ok(values)),
            }
        }
    }

    impl KvDescriptor for Dumper {
        fn name(&self) -> &str {
            "dumper"
        }

        fn key_selector(&self, key: &str) -> bool {
            key.starts_with("d/")
        }

        fn is_dumpable(&self) -> bool {
            true
        }

        fn derived_values(&self, key: &str, _value: &Value) -> Vec<KeyValuePair> {
            vec![KeyValuePair::new(format!("up/{key}"), new_value(true))]
        }

        fn dump(&self, _correlate: &[KvWithMetadata]) -> anyhow::Result<Vec<KvWithMetadata>> {
            match &*self.values.lock() {
                Ok(values) => Ok(values.clone()),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }
    }

    fn registry(dumper: Arc<Dumper>) -> DescriptorRegistry {
        let mut registry = DescriptorRegistry::new();
        registry.register(dumper).unwrap();
        registry
    }

    #[test]
    fn refresh_resolves_origins() {
        let registry = registry(Arc::new(Dumper::new(&["d/a", "d/b", "x/c", "d/a"])));
        let mut graph = Graph::default();
        let nb = BTreeMap::from([("d/a".to_string(), new_value(1u32))]);
        assert!(refresh(&registry, &mut graph, Some(&nb)).is_empty());

        let a = graph.get("d/a").unwrap();
        assert_eq!(a.origin, ValueOrigin::FromNb);
        assert_eq!(a.state, ValueState::Configured);
        let b = graph.get("d/b").unwrap();
        assert_eq!(b.origin, ValueOrigin::FromSb);
        assert_eq!(b.state, ValueState::Retrieved);
        assert!(graph.get("x/c").is_none());
        assert_eq!(graph.get("up/d/b").unwrap().derived_from.as_deref(), Some("d/b"));
    }

    #[test]
    fn refresh_forgets_vanished_values() {
        let dumper = Arc::new(Dumper::new(&["d/a", "d/b"]));
        let registry = registry(Arc::clone(&dumper));
        let mut graph = Graph::default();
        let nb = BTreeMap::from([("d/a".to_string(), new_value(1u32))]);
        refresh(&registry, &mut graph, Some(&nb));

        *dumper.values.lock() = Ok(Vec::new());
        refresh(&registry, &mut graph, None);
        let a = graph.get("d/a").unwrap();
        assert!(!a.is_present());
        assert!(graph.get("up/d/a").is_some_and(|n| !n.is_present()));
        assert!(graph.get("d/b").is_none());
        assert!(graph.get("up/d/b").is_none());
    }

    #[test]
    fn refresh_keeps_values_on_dump_error() {
        let dumper = Arc::new(Dumper::new(&["d/a"]));
        let registry = registry(Arc::clone(&dumper));
        let mut graph = Graph::default();
        refresh(&registry, &mut graph, None);

        *dumper.values.lock() = Err(anyhow::anyhow!("southbound unreachable"));
        let failures = refresh(&registry, &mut graph, None);
        assert!(graph.is_present("d/a"));
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            SchedulerError::DumpFailed { descriptor, error }
                if descriptor == "dumper" && error.to_string() == "southbound unreachable"
        ));
    }
}
