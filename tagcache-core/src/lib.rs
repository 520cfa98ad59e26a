//! tagcache-core - Cache Store Contract
//!
//! Defines the contract shared by every tagcache backend: cache items
//! addressed by a name plus a set of characteristics, the store and pool
//! traits, the payload codecs and the error taxonomy.
//!
//! A cache entry is identified by `(name, characteristics)` rather than a
//! single flat key. Characteristics are string key/value tags; queries may
//! supply a partial set of them ("needles") to find or invalidate every
//! entry carrying all of the given tags.

pub mod characteristics;
pub mod codec;
pub mod error;
pub mod item;
pub mod namespace;
pub mod store;

pub use characteristics::Characteristics;
pub use codec::PayloadCodec;
pub use error::{CacheError, CacheResult};
pub use item::CacheItem;
pub use namespace::encode_namespace;
pub use store::{resolve_now, CacheStore, CacheStorePool};
