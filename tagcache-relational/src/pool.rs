//! Namespace-keyed pool of relational cache stores.
//!
//! Each namespace maps onto its own table pair, derived from a shared
//! prefix plus a table-name-safe encoding of the namespace. Stores are
//! cached with non-owning references: the pool never keeps a store
//! alive, and a lookup after the last caller dropped its handle simply
//! rebuilds an equivalent store over the same tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use tagcache_core::{
    encode_namespace, CacheError, CacheResult, CacheStore, CacheStorePool, PayloadCodec,
};

use crate::access::RelationalAccess;
use crate::engine::DataSize;
use crate::store::{RelationalCacheStore, RelationalStoreConfig};

pub const DEFAULT_TABLE_PREFIX: &str = "tagcache_pool_";
const TABLE_DATA_SUFFIX: &str = "_data";
const TABLE_CHARACTERISTIC_SUFFIX: &str = "_characteristic";

/// Pool of per-namespace relational cache stores sharing one connection.
pub struct RelationalCacheStorePool<T> {
    access: Arc<dyn RelationalAccess>,
    table_prefix: String,
    data_size: DataSize,
    codec: PayloadCodec,
    stores: Mutex<HashMap<String, Weak<RelationalCacheStore<T>>>>,
}

impl<T> RelationalCacheStorePool<T> {
    pub fn new(access: Arc<dyn RelationalAccess>) -> Self {
        Self {
            access,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            data_size: DataSize::default(),
            codec: PayloadCodec::default(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_table_prefix(mut self, table_prefix: impl Into<String>) -> Self {
        self.table_prefix = table_prefix.into();
        self
    }

    pub fn with_data_size(mut self, data_size: DataSize) -> Self {
        self.data_size = data_size;
        self
    }

    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }
}

impl<T> CacheStorePool<T> for RelationalCacheStorePool<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn lookup_cache_store(&self, namespace: &str) -> CacheResult<Arc<dyn CacheStore<T>>> {
        let encoded = encode_namespace(namespace);

        let mut stores = self.stores.lock().map_err(|_| CacheError::OperationFailed {
            reason: "store cache lock poisoned".to_string(),
        })?;

        if let Some(store) = stores.get(&encoded).and_then(Weak::upgrade) {
            return Ok(store);
        }

        let config = RelationalStoreConfig::default()
            .with_table_names(
                format!("{}{}{}", self.table_prefix, encoded, TABLE_DATA_SUFFIX),
                format!("{}{}{}", self.table_prefix, encoded, TABLE_CHARACTERISTIC_SUFFIX),
            )
            .with_data_size(self.data_size)
            .with_codec(self.codec);

        let store = Arc::new(RelationalCacheStore::with_config(
            Arc::clone(&self.access),
            config,
        ));
        stores.insert(encoded, Arc::downgrade(&store));
        debug!(namespace, "created relational cache store for namespace");
        Ok(store)
    }

    /// Drops every table belonging to this pool's prefix.
    fn clear(&self) -> CacheResult<()> {
        let table_names = self
            .access
            .table_names()
            .map_err(|err| CacheError::OperationFailed {
                reason: err.to_string(),
            })?;

        for table_name in table_names {
            if !table_name.starts_with(&self.table_prefix) {
                continue;
            }
            self.access
                .drop_table(&table_name)
                .map_err(|err| CacheError::OperationFailed {
                    reason: err.to_string(),
                })?;
        }

        info!(prefix = %self.table_prefix, "dropped all pool cache tables");
        Ok(())
    }
}
