//! Characteristic tags attached to cache entries.
//!
//! A characteristic is one string key/value pair. The full set of
//! characteristics, together with the entry name, forms the identity of a
//! cache entry. Identity ignores insertion order: the backing map is
//! ordered by key, so two sets built in different orders encode to the
//! same canonical bytes.

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An ordered set of string key/value tags.
///
/// Keys are unique; inserting an existing key overwrites its value. The
/// set is canonically ordered by key, which makes its serialized form
/// stable regardless of how it was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Characteristics(BTreeMap<String, String>);

impl Characteristics {
    /// Creates an empty characteristic set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a characteristic, replacing any existing value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Subset test: `true` if every needle pair is present with the same
    /// value. An empty needle set matches everything.
    pub fn contains_all(&self, needles: &Characteristics) -> bool {
        needles
            .iter()
            .all(|(key, value)| self.get(key) == Some(value))
    }

    /// Splits the set into one single-pair set per characteristic, in key
    /// order. Used for index fan-out and for needle matching.
    pub fn split(&self) -> Vec<Characteristics> {
        self.iter()
            .map(|(key, value)| Characteristics::new().with(key, value))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Characteristics {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Characteristics {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
