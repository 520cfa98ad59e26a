//! Relational cache store.
//!
//! Wraps one [`RelationalCacheEngine`] behind the [`CacheStore`] contract:
//! translates ttl/now into absolute timestamps, decodes engine rows into
//! cache items and creates the schema on demand. Every public call runs
//! as a table-checked call: when the engine fails and auto-creation is
//! enabled, missing tables are created and the call retried exactly once.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use tagcache_core::{
    resolve_now, CacheError, CacheItem, CacheResult, CacheStore, Characteristics, PayloadCodec,
};

use crate::access::{AccessError, AccessResult, RelationalAccess};
use crate::engine::{DataSize, EngineRow, RelationalCacheEngine};

/// Configuration of a [`RelationalCacheStore`], fixed at construction.
#[derive(Debug, Clone)]
pub struct RelationalStoreConfig {
    pub data_table_name: String,
    pub characteristic_table_name: String,
    pub data_size: DataSize,
    pub codec: PayloadCodec,
    /// Create missing tables on demand and retry the failed call once.
    pub auto_create_tables: bool,
}

impl Default for RelationalStoreConfig {
    fn default() -> Self {
        Self {
            data_table_name: "cached_data".to_string(),
            characteristic_table_name: "cached_characteristic".to_string(),
            data_size: DataSize::default(),
            codec: PayloadCodec::default(),
            auto_create_tables: true,
        }
    }
}

impl RelationalStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table_names(
        mut self,
        data_table_name: impl Into<String>,
        characteristic_table_name: impl Into<String>,
    ) -> Self {
        self.data_table_name = data_table_name.into();
        self.characteristic_table_name = characteristic_table_name.into();
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

    pub fn with_auto_create_tables(mut self, auto_create_tables: bool) -> Self {
        self.auto_create_tables = auto_create_tables;
        self
    }
}

/// Cache store backed by one relational table pair.
pub struct RelationalCacheStore<T> {
    engine: RelationalCacheEngine,
    config: RelationalStoreConfig,
    _payload: PhantomData<fn() -> T>,
}

impl<T> RelationalCacheStore<T> {
    /// Creates a store with the default configuration.
    pub fn new(access: Arc<dyn RelationalAccess>) -> Self {
        Self::with_config(access, RelationalStoreConfig::default())
    }

    pub fn with_config(access: Arc<dyn RelationalAccess>, config: RelationalStoreConfig) -> Self {
        let engine = RelationalCacheEngine::new(
            access,
            config.data_table_name.clone(),
            config.characteristic_table_name.clone(),
            config.data_size,
            config.codec,
        );
        Self {
            engine,
            config,
            _payload: PhantomData,
        }
    }

    pub fn config(&self) -> &RelationalStoreConfig {
        &self.config
    }

    /// Creates either table if missing. Returns whether anything was
    /// created.
    fn check_tables(&self) -> AccessResult<bool> {
        let mut created = false;

        if !self.engine.does_data_table_exist()? {
            self.engine.create_data_table()?;
            created = true;
        }

        if !self.engine.does_characteristic_table_exist()? {
            self.engine.create_characteristic_table()?;
            created = true;
        }

        Ok(created)
    }

    fn table_checked_call<R>(&self, call: impl Fn() -> AccessResult<R>) -> CacheResult<R> {
        let err = match call() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if matches!(err, AccessError::IllegalTransactionState { .. }) {
            return Err(convert_access_error(err));
        }

        if !self.config.auto_create_tables || !self.check_tables().map_err(convert_access_error)? {
            return Err(convert_access_error(err));
        }

        warn!(
            data_table = %self.config.data_table_name,
            error = %err,
            "created missing cache tables, retrying operation"
        );
        call().map_err(convert_access_error)
    }
}

fn convert_access_error(err: AccessError) -> CacheError {
    match err {
        AccessError::IllegalTransactionState { reason } => CacheError::IllegalState { reason },
        other => CacheError::OperationFailed {
            reason: other.to_string(),
        },
    }
}

impl<T> RelationalCacheStore<T>
where
    T: DeserializeOwned,
{
    fn parse_item(&self, row: EngineRow) -> CacheResult<CacheItem<T>> {
        let characteristics: Characteristics = self
            .config
            .codec
            .decode(&row.characteristics)
            .map_err(|err| add_context(&row.name, "characteristics", err))?;
        let data: T = self
            .config
            .codec
            .decode(&row.data)
            .map_err(|err| add_context(&row.name, "data", err))?;
        Ok(CacheItem::new(row.name, characteristics, data))
    }
}

fn add_context(name: &str, column: &str, err: CacheError) -> CacheError {
    match err {
        CacheError::CorruptedStore { reason } => CacheError::CorruptedStore {
            reason: format!("{column} of entry {name}: {reason}"),
        },
        other => other,
    }
}

impl<T> CacheStore<T> for RelationalCacheStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
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
        let created_at = now.timestamp();
        let expires_at = ttl.map(|ttl| (now + ttl).timestamp());
        let data_bytes = self.config.codec.encode(data)?;

        self.table_checked_call(|| {
            self.engine
                .write(name, characteristics, &data_bytes, created_at, expires_at)
        })
    }

    fn get(
        &self,
        name: &str,
        characteristics: &Characteristics,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<Option<CacheItem<T>>> {
        let expired_by_time = resolve_now(now).timestamp();

        let row = self.table_checked_call(|| self.engine.read(name, characteristics, expired_by_time))?;
        row.map(|row| self.parse_item(row)).transpose()
    }

    fn remove(&self, name: &str, characteristics: &Characteristics) -> CacheResult<()> {
        self.table_checked_call(|| self.engine.delete(name, characteristics))
    }

    fn find_all(
        &self,
        name: &str,
        characteristic_needles: Option<&Characteristics>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<Vec<CacheItem<T>>> {
        let expired_by_time = resolve_now(now).timestamp();

        let rows = self.table_checked_call(|| {
            self.engine
                .find_by(Some(name), characteristic_needles, expired_by_time)
        })?;
        rows.into_iter().map(|row| self.parse_item(row)).collect()
    }

    fn remove_all(
        &self,
        name_needle: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
    ) -> CacheResult<()> {
        self.table_checked_call(|| self.engine.delete_by(name_needle, characteristic_needles))
    }

    fn garbage_collect(
        &self,
        max_lifetime: Option<TimeDelta>,
        now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let now = resolve_now(now);

        self.table_checked_call(|| self.engine.delete_expired_by_time(now.timestamp()))?;

        let Some(max_lifetime) = max_lifetime else {
            return Ok(());
        };

        let created_by_time = (now - max_lifetime).timestamp();
        self.table_checked_call(|| self.engine.delete_created_by_time(created_by_time))
    }

    fn clear(&self) -> CacheResult<()> {
        self.table_checked_call(|| self.engine.clear())
    }
}
