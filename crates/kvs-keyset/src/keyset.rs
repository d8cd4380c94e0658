//! The [`KeySet`] abstraction
//!
//! A set of keys with several interchangeable backing representations.
//! Every implementation supports copy-on-write: [`KeySet::copy_on_write`]
//! hands out a shallow handle whose storage is duplicated only on the first
//! mutation, so planning can branch key sets without paying for full copies.

use std::any::Any;
use std::fmt;

/// Set of keys.
///
/// Implementations are not required to be safe for concurrent mutation;
/// a copy obtained through [`KeySet::copy_on_write`] is meant to be owned by
/// a single task.
pub trait KeySet: fmt::Debug + fmt::Display + Send + Sync {
    /// Expose the keys for iteration.
    ///
    /// The slice may be backing storage of the set and is only valid until
    /// the next mutation.
    fn iterate(&self) -> &[String];

    /// Number of keys in the set
    fn len(&self) -> usize;

    /// Returns true if the set holds no keys
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the given key is in the set
    fn has(&self, key: &str) -> bool;

    /// Add key into the set, returns true if the set changed
    fn add(&mut self, key: &str) -> bool;

    /// Remove key from the set, returns true if the set changed
    fn del(&mut self, key: &str) -> bool;

    /// Remove keys from this set which are also in `other`
    fn subtract(&mut self, other: &dyn KeySet) -> bool;

    /// Remove keys from this set which are not in `other`
    fn intersect(&mut self, other: &dyn KeySet) -> bool;

    /// Shallow copy which gets deep-copied once it is about to be modified
    fn copy_on_write(&self) -> Box<dyn KeySet>;

    /// Access to the concrete type, used for representation-specific fast paths
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn KeySet> {
    fn clone(&self) -> Self {
        self.copy_on_write()
    }
}

/// Render keys in the `{k1, k2}` set notation.
pub(crate) fn fmt_keys<'a>(
    f: &mut fmt::Formatter<'_>,
    keys: impl IntoIterator<Item = &'a String>,
) -> fmt::Result {
    f.write_str("{")?;
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        f.write_str(key)?;
    }
    f.write_str("}")
}
