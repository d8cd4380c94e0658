//! Dependency queries and topological ordering over key sets

use crate::error::DependencyCycle;
use crate::keyset::KeySet;
use crate::slice::SliceKeySet;
use std::collections::{HashMap, HashSet};

/// For each key the set of keys it depends on. Cycles are allowed.
pub type KeyDeps = HashMap<String, Box<dyn KeySet>>;

/// Returns true if `k2` is a direct or transitive dependency of `k1`.
///
/// `visited` guards against cycles. It must be fresh (or cleared) for each
/// top-level query: a set reused from an unrelated query yields false
/// negatives. Prefer [`key_depends_on`] unless the caller manages the set.
pub fn depends_on(k1: &str, k2: &str, deps: &KeyDeps, visited: &mut HashSet<String>) -> bool {
    visited.insert(k1.to_owned());
    let Some(k1_deps) = deps.get(k1) else {
        return false;
    };
    if k1_deps.has(k2) {
        return true;
    }
    for dep in k1_deps.iterate() {
        if visited.contains(dep) {
            continue;
        }
        if depends_on(dep, k2, deps, visited) {
            return true;
        }
    }
    false
}

/// [`depends_on`] with a freshly allocated visited set
#[must_use]
pub fn key_depends_on(k1: &str, k2: &str, deps: &KeyDeps) -> bool {
    depends_on(k1, k2, deps, &mut HashSet::new())
}

/// Order `keys` with Kahn's algorithm, restricted to dependencies among `keys`.
///
/// With `dep_first` a key is placed once all of its dependencies are placed;
/// otherwise a key is placed once no remaining key depends on it, which gives
/// the order for removals. Candidates of every step are emitted sorted.
///
/// When no candidate exists the remaining keys contain a cycle. With
/// `handle_cycle` every remaining key that transitively depends on itself is
/// emitted as one sorted batch; the membership check runs a full
/// [`key_depends_on`] per remaining key, which is quadratic for large cyclic
/// remainders.
///
/// # Errors
/// Returns [`DependencyCycle`] if a cycle is found and `handle_cycle` is false
pub fn topological_order(
    keys: &dyn KeySet,
    deps: &KeyDeps,
    dep_first: bool,
    handle_cycle: bool,
) -> Result<Vec<String>, DependencyCycle> {
    let mut remains = keys.copy_on_write();
    let mut restricted: KeyDeps = HashMap::with_capacity(keys.len());
    for key in keys.iterate() {
        let mut key_deps = match deps.get(key) {
            Some(key_deps) => key_deps.copy_on_write(),
            None => Box::new(SliceKeySet::default()),
        };
        key_deps.intersect(keys);
        restricted.insert(key.clone(), key_deps);
    }

    let mut sorted = Vec::with_capacity(keys.len());
    while !remains.is_empty() {
        let remaining = remains.iterate().to_vec();
        let mut candidates: Vec<String> = remaining
            .iter()
            .filter(|key| {
                if dep_first {
                    restricted.get(*key).map_or(true, |key_deps| key_deps.is_empty())
                } else {
                    !remaining.iter().any(|other| {
                        restricted
                            .get(other)
                            .is_some_and(|other_deps| other_deps.has(key))
                    })
                }
            })
            .cloned()
            .collect();

        if candidates.is_empty() && handle_cycle {
            candidates = remaining
                .iter()
                .filter(|key| key_depends_on(key, key, &restricted))
                .cloned()
                .collect();
        }
        if candidates.is_empty() {
            let mut keys = remaining;
            keys.sort();
            return Err(DependencyCycle { keys });
        }

        candidates.sort();
        let placed = SliceKeySet::new(&candidates);
        remains.subtract(&placed);
        for key in &candidates {
            restricted.remove(key);
        }
        for key_deps in restricted.values_mut() {
            key_deps.subtract(&placed);
        }
        sorted.extend(candidates);
    }
    Ok(sorted)
}
