//! No-op cache store.
//!
//! Accepts every operation and stores nothing. Used to switch caching
//! off without touching caller code.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use tagcache_core::{
    CacheItem, CacheResult, CacheStore, CacheStorePool, Characteristics,
};

/// Cache store that never stores anything.
#[derive(Debug, Default)]
pub struct NullCacheStore<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> NullCacheStore<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> CacheStore<T> for NullCacheStore<T>
where
    T: Send + Sync,
{
    fn store(
        &self,
        _name: &str,
        _characteristics: &Characteristics,
        _data: &T,
        _ttl: Option<TimeDelta>,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        Ok(())
    }

    fn get(
        &self,
        _name: &str,
        _characteristics: &Characteristics,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<Option<CacheItem<T>>> {
        Ok(None)
    }

    fn remove(&self, _name: &str, _characteristics: &Characteristics) -> CacheResult<()> {
        Ok(())
    }

    fn find_all(
        &self,
        _name: &str,
        _characteristic_needles: Option<&Characteristics>,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<Vec<CacheItem<T>>> {
        Ok(Vec::new())
    }

    fn remove_all(
        &self,
        _name_needle: Option<&str>,
        _characteristic_needles: Option<&Characteristics>,
    ) -> CacheResult<()> {
        Ok(())
    }

    fn garbage_collect(
        &self,
        _max_lifetime: Option<TimeDelta>,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// Pool handing out the same no-op store for every namespace.
#[derive(Debug)]
pub struct NullCacheStorePool<T> {
    store: Arc<NullCacheStore<T>>,
}

impl<T> NullCacheStorePool<T> {
    pub fn new() -> Self {
        Self {
            store: Arc::new(NullCacheStore::new()),
        }
    }
}

impl<T> Default for NullCacheStorePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheStorePool<T> for NullCacheStorePool<T>
where
    T: Send + Sync + 'static,
{
    fn lookup_cache_store(&self, _namespace: &str) -> CacheResult<Arc<dyn CacheStore<T>>> {
        Ok(Arc::clone(&self.store) as Arc<dyn CacheStore<T>>)
    }

    fn clear(&self) -> CacheResult<()> {
        Ok(())
    }
}
