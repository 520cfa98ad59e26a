//! tagcache-adapters - Cache Client Protocol Adapters
//!
//! Exposes any [`CacheStore`](tagcache_core::CacheStore) through two
//! standard cache-client call patterns: a flat key/value client
//! ([`SimpleCache`]) and a deferred-commit item pool
//! ([`CacheItemPool`]). Both address the wrapped store with the key as
//! the entry name and an empty characteristic set.
//!
//! Mutating adapter methods return `CacheResult<bool>`: `Ok(false)`
//! means the backend does not support the operation (callers degrade
//! gracefully), while genuine failures stay errors.

pub mod item_pool;
pub mod simple;

pub use item_pool::{CacheItemPool, PoolItem};
pub use simple::SimpleCache;

use tagcache_core::{CacheError, CacheResult};

/// Characters a cache key may not contain.
const INVALID_KEY_CHARS: &[char] = &['{', '}', '(', ')', '/', '\\', '@', ':'];

/// Validates an adapter-level cache key.
///
/// Keys must be non-empty, printable and free of the reserved
/// characters `{}()/\@:`.
pub(crate) fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty()
        || key
            .chars()
            .any(|c| c.is_control() || INVALID_KEY_CHARS.contains(&c))
    {
        return Err(CacheError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Maps an operation outcome into the adapters' boolean idiom:
/// success is `true`, an unsupported capability degrades to `false`,
/// everything else stays an error.
pub(crate) fn degrade_unsupported(result: CacheResult<()>) -> CacheResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(CacheError::Unsupported { store, operation }) => {
            tracing::debug!(store, operation, "operation unsupported by backend");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}
