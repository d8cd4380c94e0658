//! Key set holding at most one key

use crate::keyset::{fmt_keys, KeySet};
use serde::{Serialize, Serializer};
use std::any::Any;
use std::fmt;

/// [`KeySet`] guaranteed to contain at most one key.
///
/// Adding a key replaces the held one. Copy-on-write is a plain copy here,
/// which is as cheap as a shallow handle for a single key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingletonKeySet {
    key: Option<String>,
}

impl SingletonKeySet {
    /// Create singleton set; an empty key yields the empty set
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: (!key.is_empty()).then(|| key.to_owned()),
        }
    }
}

impl KeySet for SingletonKeySet {
    fn iterate(&self) -> &[String] {
        match &self.key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    fn len(&self) -> usize {
        usize::from(self.key.is_some())
    }

    fn has(&self, key: &str) -> bool {
        self.key.as_deref() == Some(key)
    }

    fn add(&mut self, key: &str) -> bool {
        if key.is_empty() || self.has(key) {
            return false;
        }
        self.key = Some(key.to_owned());
        true
    }

    fn del(&mut self, key: &str) -> bool {
        if self.has(key) {
            self.key = None;
            return true;
        }
        false
    }

    fn subtract(&mut self, other: &dyn KeySet) -> bool {
        match &self.key {
            Some(key) if other.has(key) => {
                self.key = None;
                true
            }
            _ => false,
        }
    }

    fn intersect(&mut self, other: &dyn KeySet) -> bool {
        match &self.key {
            Some(key) if !other.has(key) => {
                self.key = None;
                true
            }
            _ => false,
        }
    }

    fn copy_on_write(&self) -> Box<dyn KeySet> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for SingletonKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_keys(f, self.iterate())
    }
}

impl Serialize for SingletonKeySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iterate())
    }
}
