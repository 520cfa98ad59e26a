//! Cache store and store pool traits.
//!
//! All operations are synchronous, blocking calls. Implementations must be
//! safe to share across threads; coordination beyond that (transaction
//! isolation, file-system atomicity) is the backend's concern.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::characteristics::Characteristics;
use crate::error::CacheResult;
use crate::item::CacheItem;

/// Resolves an optional caller-supplied clock value to a concrete instant.
pub fn resolve_now(now: Option<DateTime<Utc>>) -> DateTime<Utc> {
    now.unwrap_or_else(Utc::now)
}

/// A named, characteristic-tagged cache storage backend.
///
/// Entries are addressed by `(name, characteristics)`. The full set of
/// characteristics is part of the identity; queries taking *needles*
/// instead match every entry that carries all of the given pairs.
///
/// `now` parameters exist so callers (and tests) can pin the clock; `None`
/// means the current instant. An entry whose expiry lies at or before the
/// effective `now` is treated as absent even if the backend still holds
/// its bytes.
pub trait CacheStore<T>: Send + Sync {
    /// Stores or overwrites the entry identified by `(name, characteristics)`.
    ///
    /// `ttl` is translated into an absolute expiry relative to `now`;
    /// without a ttl the entry never expires. Writing the same identity
    /// twice leaves a single entry holding the latest payload.
    fn store(
        &self,
        name: &str,
        characteristics: &Characteristics,
        data: &T,
        ttl: Option<TimeDelta>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<()>;

    /// Looks up one entry by exact identity.
    fn get(
        &self,
        name: &str,
        characteristics: &Characteristics,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<Option<CacheItem<T>>>;

    /// Removes one entry by exact identity. Removing an absent entry is a
    /// no-op success.
    fn remove(&self, name: &str, characteristics: &Characteristics) -> CacheResult<()>;

    /// Finds every non-expired entry named `name` that carries all
    /// `characteristic_needles` pairs (all entries of that name when the
    /// needles are `None`). Result order is backend order, not sorted.
    fn find_all(
        &self,
        name: &str,
        characteristic_needles: Option<&Characteristics>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<Vec<CacheItem<T>>>;

    /// Removes every entry matching the needle query. Both needles `None`
    /// removes everything.
    fn remove_all(
        &self,
        name_needle: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
    ) -> CacheResult<()>;

    /// Purges expired entries, and entries created before
    /// `now - max_lifetime` when a maximum lifetime is given.
    ///
    /// Backends without a notion of expiry scanning return
    /// [`CacheError::Unsupported`](crate::CacheError::Unsupported).
    fn garbage_collect(
        &self,
        max_lifetime: Option<TimeDelta>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<()>;

    /// Removes all entries unconditionally.
    fn clear(&self) -> CacheResult<()>;
}

/// Maps logical namespaces onto lazily created cache stores.
pub trait CacheStorePool<T>: Send + Sync {
    /// Returns the store for `namespace`, creating it on first use.
    ///
    /// Two lookups of the same namespace observe the same underlying
    /// data, whether or not they return the same store instance.
    fn lookup_cache_store(&self, namespace: &str) -> CacheResult<Arc<dyn CacheStore<T>>>;

    /// Removes all stored data of every namespace belonging to this pool.
    fn clear(&self) -> CacheResult<()>;
}
