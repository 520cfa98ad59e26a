//! tagcache-stores - Non-Relational Cache Store Backends
//!
//! The lightweight backends of tagcache: a process-local ephemeral
//! store, a no-op null store and a file-backed store, each with its
//! namespace pool. All of them implement the
//! [`CacheStore`](tagcache_core::CacheStore) /
//! [`CacheStorePool`](tagcache_core::CacheStorePool) contracts from
//! `tagcache-core`.

pub mod ephemeral;
pub mod fs;
pub mod null;

pub use ephemeral::{EphemeralCacheStore, EphemeralCacheStorePool};
pub use fs::{FileCacheStore, FileCacheStorePool};
pub use null::{NullCacheStore, NullCacheStorePool};
