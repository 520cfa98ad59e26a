//! Deferred-commit item-pool cache client.
//!
//! Items are fetched from the pool, mutated locally and written back
//! with `save`, or queued with `save_deferred` and flushed in order by
//! `commit`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use tagcache_core::{resolve_now, CacheError, CacheResult, CacheStore, Characteristics};

use crate::{degrade_unsupported, validate_key};

/// One pool item: a key, an optional value and local expiry state.
#[derive(Debug, Clone)]
pub struct PoolItem<T> {
    key: String,
    value: Option<T>,
    hit: bool,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> PoolItem<T> {
    fn new(key: String, value: Option<T>, hit: bool) -> Self {
        Self {
            key,
            value,
            hit,
            expires_at: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Whether the item came from the cache.
    pub fn is_hit(&self) -> bool {
        self.hit
    }

    /// Replaces the value; the item counts as a hit afterwards.
    pub fn set(&mut self, value: T) -> &mut Self {
        self.value = Some(value);
        self.hit = true;
        self
    }

    /// Pins an absolute expiry instant; `None` removes it.
    pub fn expires_at(&mut self, expiration: Option<DateTime<Utc>>) -> &mut Self {
        self.expires_at = expiration;
        self
    }

    /// Sets the expiry relative to now; `None` removes it.
    pub fn expires_after(&mut self, ttl: Option<TimeDelta>) -> &mut Self {
        self.expires_at = ttl.map(|ttl| Utc::now() + ttl);
        self
    }

    fn ttl_from(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.expires_at.map(|expires_at| expires_at - now)
    }
}

/// Item pool over a cache store.
pub struct CacheItemPool<T> {
    store: Arc<dyn CacheStore<T>>,
    deferred: Mutex<Vec<PoolItem<T>>>,
}

impl<T> CacheItemPool<T> {
    pub fn new(store: Arc<dyn CacheStore<T>>) -> Self {
        Self {
            store,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Fetches the item for `key`; a miss yields an empty, non-hit item
    /// that can be filled in and saved.
    pub fn item(&self, key: &str) -> CacheResult<PoolItem<T>> {
        validate_key(key)?;

        match self.store.get(key, &Characteristics::new(), None)? {
            Some(cache_item) => Ok(PoolItem::new(
                key.to_string(),
                Some(cache_item.into_data()),
                true,
            )),
            None => Ok(PoolItem::new(key.to_string(), None, false)),
        }
    }

    pub fn items(&self, keys: &[&str]) -> CacheResult<Vec<PoolItem<T>>> {
        keys.iter().map(|key| self.item(key)).collect()
    }

    pub fn has_item(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        Ok(self.store.get(key, &Characteristics::new(), None)?.is_some())
    }

    /// Writes one item back to the store.
    pub fn save(&self, item: &PoolItem<T>) -> CacheResult<bool> {
        let Some(value) = item.value.as_ref() else {
            return Err(CacheError::OperationFailed {
                reason: format!("cannot save cache item {} without a value", item.key),
            });
        };

        let now = resolve_now(None);
        degrade_unsupported(self.store.store(
            &item.key,
            &Characteristics::new(),
            value,
            item.ttl_from(now),
            Some(now),
        ))
    }

    /// Queues an item for a later [`commit`](Self::commit).
    pub fn save_deferred(&self, item: PoolItem<T>) -> CacheResult<()> {
        self.deferred
            .lock()
            .map_err(|_| CacheError::OperationFailed {
                reason: "deferred queue lock poisoned".to_string(),
            })?
            .push(item);
        Ok(())
    }

    /// Saves all deferred items in the order they were queued.
    ///
    /// `Ok(false)` if any save was unsupported; a failing save leaves
    /// the remaining items queued.
    pub fn commit(&self) -> CacheResult<bool> {
        let mut all_saved = true;
        loop {
            let item = {
                let mut deferred =
                    self.deferred
                        .lock()
                        .map_err(|_| CacheError::OperationFailed {
                            reason: "deferred queue lock poisoned".to_string(),
                        })?;
                if deferred.is_empty() {
                    break;
                }
                deferred.remove(0)
            };
            all_saved &= self.save(&item)?;
        }
        Ok(all_saved)
    }

    pub fn delete_item(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        degrade_unsupported(self.store.remove(key, &Characteristics::new()))
    }

    pub fn delete_items(&self, keys: &[&str]) -> CacheResult<bool> {
        let mut all_deleted = true;
        for key in keys {
            all_deleted &= self.delete_item(key)?;
        }
        Ok(all_deleted)
    }

    pub fn clear(&self) -> CacheResult<bool> {
        degrade_unsupported(self.store.clear())
    }
}
