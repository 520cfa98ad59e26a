//! In-process cache store.
//!
//! Holds entries in a plain map for the lifetime of the process. Useful
//! as a per-request or test cache; nothing survives a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};

use tagcache_core::{
    resolve_now, CacheError, CacheItem, CacheResult, CacheStore, CacheStorePool, Characteristics,
};

#[derive(Debug, Clone)]
struct StoredEntry<T> {
    data: T,
    created_at: i64,
    expires_at: Option<i64>,
}

impl<T> StoredEntry<T> {
    fn is_expired_by(&self, expired_by_time: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= expired_by_time)
    }
}

/// Process-local cache store.
#[derive(Debug, Default)]
pub struct EphemeralCacheStore<T> {
    entries: Mutex<HashMap<(String, Characteristics), StoredEntry<T>>>,
}

impl<T> EphemeralCacheStore<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> CacheResult<MutexGuard<'_, HashMap<(String, Characteristics), StoredEntry<T>>>> {
        self.entries.lock().map_err(|_| CacheError::OperationFailed {
            reason: "ephemeral store lock poisoned".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches_query(
    key: &(String, Characteristics),
    name_needle: Option<&str>,
    characteristic_needles: Option<&Characteristics>,
) -> bool {
    if name_needle.is_some_and(|name| name != key.0) {
        return false;
    }
    characteristic_needles
        .map(|needles| key.1.contains_all(needles))
        .unwrap_or(true)
}

impl<T> CacheStore<T> for EphemeralCacheStore<T>
where
    T: Clone + Send + Sync,
{
    fn store(
        &self,
        name: &str,
        characteristics: &Characteristics,
        data: &T,
        ttl: Option<TimeDelta>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let now = resolve_now(now);
        let entry = StoredEntry {
            data: data.clone(),
            created_at: now.timestamp(),
            expires_at: ttl.map(|ttl| (now + ttl).timestamp()),
        };
        self.entries()?
            .insert((name.to_string(), characteristics.clone()), entry);
        Ok(())
    }

    fn get(
        &self,
        name: &str,
        characteristics: &Characteristics,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<Option<CacheItem<T>>> {
        let expired_by_time = resolve_now(now).timestamp();
        let key = (name.to_string(), characteristics.clone());

        let mut entries = self.entries()?;
        let Some(entry) = entries.get(&key) else {
            return Ok(None);
        };

        if entry.is_expired_by(expired_by_time) {
            entries.remove(&key);
            return Ok(None);
        }

        Ok(Some(CacheItem::new(
            name,
            characteristics.clone(),
            entry.data.clone(),
        )))
    }

    fn remove(&self, name: &str, characteristics: &Characteristics) -> CacheResult<()> {
        self.entries()?
            .remove(&(name.to_string(), characteristics.clone()));
        Ok(())
    }

    fn find_all(
        &self,
        name: &str,
        characteristic_needles: Option<&Characteristics>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<Vec<CacheItem<T>>> {
        let expired_by_time = resolve_now(now).timestamp();

        let entries = self.entries()?;
        Ok(entries
            .iter()
            .filter(|(key, entry)| {
                matches_query(key, Some(name), characteristic_needles)
                    && !entry.is_expired_by(expired_by_time)
            })
            .map(|((name, characteristics), entry)| {
                CacheItem::new(name.clone(), characteristics.clone(), entry.data.clone())
            })
            .collect())
    }

    fn remove_all(
        &self,
        name_needle: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
    ) -> CacheResult<()> {
        self.entries()?
            .retain(|key, _| !matches_query(key, name_needle, characteristic_needles));
        Ok(())
    }

    fn garbage_collect(
        &self,
        max_lifetime: Option<TimeDelta>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let now = resolve_now(now);
        let expired_by_time = now.timestamp();
        let created_by_time = max_lifetime.map(|max_lifetime| (now - max_lifetime).timestamp());

        self.entries()?.retain(|_, entry| {
            if entry.is_expired_by(expired_by_time) {
                return false;
            }
            created_by_time.map_or(true, |cutoff| entry.created_at > cutoff)
        });
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.entries()?.clear();
        Ok(())
    }
}

/// Pool of process-local stores, one per namespace.
#[derive(Debug, Default)]
pub struct EphemeralCacheStorePool<T> {
    stores: Mutex<HashMap<String, Arc<EphemeralCacheStore<T>>>>,
}

impl<T> EphemeralCacheStorePool<T> {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> CacheStorePool<T> for EphemeralCacheStorePool<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn lookup_cache_store(&self, namespace: &str) -> CacheResult<Arc<dyn CacheStore<T>>> {
        let mut stores = self.stores.lock().map_err(|_| CacheError::OperationFailed {
            reason: "ephemeral pool lock poisoned".to_string(),
        })?;
        let store = stores
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(EphemeralCacheStore::new()));
        Ok(Arc::clone(store) as Arc<dyn CacheStore<T>>)
    }

    fn clear(&self) -> CacheResult<()> {
        self.stores
            .lock()
            .map_err(|_| CacheError::OperationFailed {
                reason: "ephemeral pool lock poisoned".to_string(),
            })?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn characteristics(pairs: &[(&str, &str)]) -> Characteristics {
        pairs.iter().copied().collect()
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn test_store_and_get() {
        let store = EphemeralCacheStore::new();
        let chars = characteristics(&[("lang", "de")]);

        store.store("report", &chars, &"payload".to_string(), None, None).unwrap();

        let item = store.get("report", &chars, None).unwrap().unwrap();
        assert_eq!(item.name(), "report");
        assert_eq!(item.data(), "payload");
    }

    #[test]
    fn test_identity_ignores_key_order() {
        let store = EphemeralCacheStore::new();

        store
            .store(
                "report",
                &characteristics(&[("a", "1"), ("b", "2")]),
                &"payload".to_string(),
                None,
                None,
            )
            .unwrap();

        assert!(store
            .get("report", &characteristics(&[("b", "2"), ("a", "1")]), None)
            .unwrap()
            .is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_overwrite_keeps_one_entry() {
        let store = EphemeralCacheStore::new();
        let chars = characteristics(&[("k", "v")]);

        store.store("entry", &chars, &"old".to_string(), None, None).unwrap();
        store.store("entry", &chars, &"new".to_string(), None, None).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("entry", &chars, None).unwrap().unwrap().data(),
            "new"
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let store = EphemeralCacheStore::new();
        let chars = characteristics(&[("k", "v")]);

        store
            .store(
                "entry",
                &chars,
                &"payload".to_string(),
                Some(TimeDelta::seconds(60)),
                Some(at(1_000)),
            )
            .unwrap();

        assert!(store.get("entry", &chars, Some(at(1_059))).unwrap().is_some());
        assert!(store.get("entry", &chars, Some(at(1_060))).unwrap().is_none());
        // expired entries are evicted on access
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_find_all_needle_subset_semantics() {
        let store = EphemeralCacheStore::new();

        store
            .store(
                "entry",
                &characteristics(&[("key", "value"), ("o-key", "o-value")]),
                &"two".to_string(),
                None,
                None,
            )
            .unwrap();
        store
            .store(
                "entry",
                &characteristics(&[("key", "value"), ("o-key", "o-value"), ("to-key", "to-value")]),
                &"three".to_string(),
                None,
                None,
            )
            .unwrap();

        let items = store
            .find_all(
                "entry",
                Some(&characteristics(&[("o-key", "o-value"), ("to-key", "to-value")])),
                None,
            )
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data(), "three");
    }

    #[test]
    fn test_remove_all_scenario() {
        let store = EphemeralCacheStore::new();

        store
            .store(
                "entry",
                &characteristics(&[("key", "value0")]),
                &"data0".to_string(),
                None,
                None,
            )
            .unwrap();
        store
            .store(
                "entry",
                &characteristics(&[("key", "value1"), ("o-key", "o-value")]),
                &"data1".to_string(),
                None,
                None,
            )
            .unwrap();

        store
            .remove_all(Some("entry"), Some(&characteristics(&[("key", "value0")])))
            .unwrap();

        let items = store.find_all("entry", None, None).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data(), "data1");
    }

    #[test]
    fn test_garbage_collect_policies() {
        let store = EphemeralCacheStore::new();

        store
            .store(
                "expiring",
                &characteristics(&[("k", "1")]),
                &"a".to_string(),
                Some(TimeDelta::seconds(10)),
                Some(at(1_000)),
            )
            .unwrap();
        store
            .store(
                "aged",
                &characteristics(&[("k", "2")]),
                &"b".to_string(),
                None,
                Some(at(1_000)),
            )
            .unwrap();
        store
            .store(
                "young",
                &characteristics(&[("k", "3")]),
                &"c".to_string(),
                None,
                Some(at(2_000)),
            )
            .unwrap();

        store
            .garbage_collect(Some(TimeDelta::seconds(500)), Some(at(2_000)))
            .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store
            .get("young", &characteristics(&[("k", "3")]), Some(at(2_000)))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_clear() {
        let store = EphemeralCacheStore::new();
        store
            .store("a", &characteristics(&[("k", "v")]), &"x".to_string(), None, None)
            .unwrap();

        store.clear().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_pool_caches_stores_per_namespace() {
        let pool: EphemeralCacheStorePool<String> = EphemeralCacheStorePool::new();

        let a = pool.lookup_cache_store("ns1").unwrap();
        let b = pool.lookup_cache_store("ns1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.store(
            "entry",
            &characteristics(&[("k", "v")]),
            &"x".to_string(),
            None,
            None,
        )
        .unwrap();
        assert!(pool
            .lookup_cache_store("ns2")
            .unwrap()
            .get("entry", &characteristics(&[("k", "v")]), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_pool_clear_detaches_namespaces() {
        let pool: EphemeralCacheStorePool<String> = EphemeralCacheStorePool::new();
        let chars = characteristics(&[("k", "v")]);

        pool.lookup_cache_store("ns1")
            .unwrap()
            .store("entry", &chars, &"x".to_string(), None, None)
            .unwrap();

        pool.clear().unwrap();

        assert!(pool
            .lookup_cache_store("ns1")
            .unwrap()
            .get("entry", &chars, None)
            .unwrap()
            .is_none());
    }
}
