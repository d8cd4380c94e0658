//! Key set backed by a hash set

use crate::keyset::{fmt_keys, KeySet};
use serde::{Serialize, Serializer};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// [`KeySet`] implemented using a hash set.
///
/// Quicker lookups on average than [`SliceKeySet`](crate::SliceKeySet), but a
/// bigger memory footprint and much slower deep copies. Iteration order is
/// unspecified.
#[derive(Debug, Clone, Default)]
pub struct MapKeySet {
    set: Arc<HashSet<String>>,
    /// Iteration snapshot, rebuilt lazily after a removal; shared by copies
    iter: OnceLock<Arc<Vec<String>>>,
}

impl MapKeySet {
    /// Create set from the given keys
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for key in keys {
            set.add(key.as_ref());
        }
        set
    }
}

impl KeySet for MapKeySet {
    fn iterate(&self) -> &[String] {
        self.iter
            .get_or_init(|| Arc::new(self.set.iter().cloned().collect()))
            .as_slice()
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn has(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    fn add(&mut self, key: &str) -> bool {
        if self.has(key) {
            return false;
        }
        Arc::make_mut(&mut self.set).insert(key.to_owned());
        if let Some(iter) = self.iter.get_mut() {
            Arc::make_mut(iter).push(key.to_owned());
        }
        true
    }

    fn del(&mut self, key: &str) -> bool {
        if !self.has(key) {
            return false;
        }
        Arc::make_mut(&mut self.set).remove(key);
        self.iter = OnceLock::new();
        true
    }

    fn subtract(&mut self, other: &dyn KeySet) -> bool {
        let mut changed = false;
        for key in other.iterate() {
            changed |= self.del(key);
        }
        changed
    }

    fn intersect(&mut self, other: &dyn KeySet) -> bool {
        let removed: Vec<String> = self
            .set
            .iter()
            .filter(|key| !other.has(key))
            .cloned()
            .collect();
        for key in &removed {
            self.del(key);
        }
        !removed.is_empty()
    }

    fn copy_on_write(&self) -> Box<dyn KeySet> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<S: AsRef<str>> FromIterator<S> for MapKeySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for MapKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_keys(f, self.set.iter())
    }
}

impl Serialize for MapKeySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.set.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SliceKeySet;
    use std::collections::BTreeSet;

    fn as_sorted(set: &dyn KeySet) -> Vec<String> {
        set.iterate().iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }

    #[test]
    fn map_iteration_tracks_mutations() {
        let mut set = MapKeySet::new(["a", "b"]);
        assert_eq!(as_sorted(&set), ["a", "b"]);
        assert!(set.add("c"));
        assert_eq!(as_sorted(&set), ["a", "b", "c"]);
        assert!(set.del("a"));
        assert_eq!(as_sorted(&set), ["b", "c"]);
        assert_eq!(set.iterate().len(), set.len());
    }

    #[test]
    fn map_subtract_slice_based() {
        let mut set = MapKeySet::new(["a", "b", "c"]);
        assert!(set.subtract(&SliceKeySet::new(["a", "c"])));
        assert_eq!(as_sorted(&set), ["b"]);
    }

    #[test]
    fn map_intersect() {
        let mut set = MapKeySet::new(["a", "b", "c"]);
        assert!(set.intersect(&SliceKeySet::new(["c", "d"])));
        assert_eq!(as_sorted(&set), ["c"]);
        assert!(!set.intersect(&MapKeySet::new(["c"])));
    }

    #[test]
    fn map_copy_on_write_both_directions() {
        let mut set = MapKeySet::new(["a", "b"]);
        let mut copy = set.copy_on_write();
        assert!(copy.del("a"));
        assert!(set.has("a"));
        assert!(set.add("z"));
        assert!(!copy.has("z"));
        assert_eq!(as_sorted(copy.as_ref()), ["b"]);
        assert_eq!(as_sorted(&set), ["a", "b", "z"]);
    }

    #[test]
    fn map_copy_shares_iteration_snapshot() {
        let mut set = MapKeySet::new(["a", "b"]);
        let snapshot = set.iterate().as_ptr();
        let copy = set.copy_on_write();
        assert!(std::ptr::eq(copy.iterate().as_ptr(), snapshot));

        assert!(set.add("c"));
        assert!(!std::ptr::eq(set.iterate().as_ptr(), snapshot));
        assert!(std::ptr::eq(copy.iterate().as_ptr(), snapshot));
        assert_eq!(as_sorted(copy.as_ref()), ["a", "b"]);
    }

    #[test]
    fn map_display_contains_all_keys() {
        let set = MapKeySet::new(["a", "b"]);
        let rendered = set.to_string();
        assert!(rendered == "{a, b}" || rendered == "{b, a}");
    }
}
