//! tagcache-relational - Characteristic-Indexed Relational Cache
//!
//! The relational backend of tagcache: a cache engine that maps
//! `(name, characteristics)` entries onto a two-table schema (data rows
//! plus an inverted characteristic index), a store wrapping the engine
//! behind the [`CacheStore`](tagcache_core::CacheStore) contract with
//! create-tables-on-demand, and a pool handing out per-namespace stores
//! over one shared connection.
//!
//! The engine consumes its database through the [`RelationalAccess`]
//! boundary; [`SqliteAccess`] is the bundled provider.

pub mod access;
pub mod engine;
pub mod pool;
pub mod sqlite;
pub mod store;

pub use access::{
    AccessError, AccessResult, ColumnKind, ColumnSpec, IndexKind, IndexSpec, ParamMap,
    RelationalAccess, ResultSet, Row, SqlValue, Statement, TableSpec,
};
pub use engine::{DataSize, EngineRow, RelationalCacheEngine};
pub use pool::{RelationalCacheStorePool, DEFAULT_TABLE_PREFIX};
pub use sqlite::SqliteAccess;
pub use store::{RelationalCacheStore, RelationalStoreConfig};
