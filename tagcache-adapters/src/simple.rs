//! Flat key/value cache client.

use std::sync::Arc;

use chrono::TimeDelta;

use tagcache_core::{CacheResult, CacheStore, Characteristics};

use crate::{degrade_unsupported, validate_key};

/// Key/value view over a cache store.
///
/// Keys map onto entry names with an empty characteristic set, so a
/// `SimpleCache` shares data with any other client addressing the same
/// store with characteristic-less entries.
pub struct SimpleCache<T> {
    store: Arc<dyn CacheStore<T>>,
}

impl<T> SimpleCache<T> {
    pub fn new(store: Arc<dyn CacheStore<T>>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> CacheResult<Option<T>> {
        validate_key(key)?;
        Ok(self
            .store
            .get(key, &Characteristics::new(), None)?
            .map(|item| item.into_data()))
    }

    pub fn set(&self, key: &str, value: &T, ttl: Option<TimeDelta>) -> CacheResult<bool> {
        validate_key(key)?;
        degrade_unsupported(self.store.store(key, &Characteristics::new(), value, ttl, None))
    }

    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        degrade_unsupported(self.store.remove(key, &Characteristics::new()))
    }

    pub fn clear(&self) -> CacheResult<bool> {
        degrade_unsupported(self.store.clear())
    }

    /// Looks up several keys; the result vector is parallel to `keys`.
    pub fn get_multiple(&self, keys: &[&str]) -> CacheResult<Vec<Option<T>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Stores several values under one ttl. `Ok(false)` if any single
    /// set was unsupported.
    pub fn set_multiple<'a, I>(&self, values: I, ttl: Option<TimeDelta>) -> CacheResult<bool>
    where
        I: IntoIterator<Item = (&'a str, &'a T)>,
        T: 'a,
    {
        let mut all_stored = true;
        for (key, value) in values {
            all_stored &= self.set(key, value, ttl)?;
        }
        Ok(all_stored)
    }

    pub fn delete_multiple<'a, I>(&self, keys: I) -> CacheResult<bool>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut all_deleted = true;
        for key in keys {
            all_deleted &= self.delete(key)?;
        }
        Ok(all_deleted)
    }

    pub fn has(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        Ok(self.store.get(key, &Characteristics::new(), None)?.is_some())
    }
}
