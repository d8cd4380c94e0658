//! Key set backed by a sorted vector

use crate::keyset::{fmt_keys, KeySet};
use serde::{Serialize, Serializer};
use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Sets up to this length are searched linearly.
const LINEAR_SEARCH_THRESHOLD: usize = 5;

/// [`KeySet`] implemented as a sorted vector of keys.
///
/// Smaller memory footprint and cheaper copies than [`MapKeySet`](crate::MapKeySet).
/// The vector is shared between copies until one of them mutates it.
#[derive(Debug, Clone, Default)]
pub struct SliceKeySet {
    set: Arc<Vec<String>>,
}

impl SliceKeySet {
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

    /// Position of the key, or the position where it would be inserted.
    fn key_index(&self, key: &str) -> Result<usize, usize> {
        if self.set.len() <= LINEAR_SEARCH_THRESHOLD {
            for (idx, item) in self.set.iter().enumerate() {
                match item.as_str().cmp(key) {
                    Ordering::Less => {}
                    Ordering::Equal => return Ok(idx),
                    Ordering::Greater => return Err(idx),
                }
            }
            return Err(self.set.len());
        }
        self.set.binary_search_by(|item| item.as_str().cmp(key))
    }

    /// Merge pass over two sorted vectors.
    fn subtract_sorted(&mut self, other: &SliceKeySet) -> bool {
        let (ours, theirs) = (&self.set, &other.set);
        let mut kept = Vec::with_capacity(ours.len());
        let mut j = 0;
        for key in ours.iter() {
            while j < theirs.len() && theirs[j] < *key {
                j += 1;
            }
            if j < theirs.len() && theirs[j] == *key {
                j += 1;
                continue;
            }
            kept.push(key.clone());
        }
        if kept.len() == ours.len() {
            return false;
        }
        self.set = Arc::new(kept);
        true
    }
}

impl KeySet for SliceKeySet {
    fn iterate(&self) -> &[String] {
        &self.set
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn has(&self, key: &str) -> bool {
        self.key_index(key).is_ok()
    }

    fn add(&mut self, key: &str) -> bool {
        match self.key_index(key) {
            Ok(_) => false,
            Err(pos) => {
                Arc::make_mut(&mut self.set).insert(pos, key.to_owned());
                true
            }
        }
    }

    fn del(&mut self, key: &str) -> bool {
        match self.key_index(key) {
            Ok(pos) => {
                Arc::make_mut(&mut self.set).remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    fn subtract(&mut self, other: &dyn KeySet) -> bool {
        if let Some(sorted) = other.as_any().downcast_ref::<SliceKeySet>() {
            return self.subtract_sorted(sorted);
        }
        let mut changed = false;
        for key in other.iterate() {
            changed |= self.del(key);
        }
        changed
    }

    fn intersect(&mut self, other: &dyn KeySet) -> bool {
        if self.set.iter().all(|key| other.has(key)) {
            return false;
        }
        Arc::make_mut(&mut self.set).retain(|key| other.has(key));
        true
    }

    fn copy_on_write(&self) -> Box<dyn KeySet> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<S: AsRef<str>> FromIterator<S> for SliceKeySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for SliceKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_keys(f, self.set.iter())
    }
}

impl Serialize for SliceKeySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.set.iter())
    }
}
