//! Relational access boundary.
//!
//! The cache engine talks to its database exclusively through
//! [`RelationalAccess`]: parametrized statements, transaction control and
//! a small schema DDL surface. Everything the engine needs to know about
//! a provider failure is captured by [`AccessError`]; only deadlocks are
//! safe to retry verbatim.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

/// Errors raised by a relational access provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    /// The transaction lost a lock race and was aborted by the database.
    /// Retrying the same work is safe.
    #[error("deadlock detected: {reason}")]
    Deadlock { reason: String },

    /// Table creation was attempted for a table that already exists.
    /// Creation is not idempotent; callers must check existence first.
    #[error("schema element already exists: {name}")]
    DuplicateSchemaElement { name: String },

    /// The engine was asked to manage a transaction while the caller
    /// already holds one open. This is a usage error and is never retried.
    #[error("illegal transaction state: {reason}")]
    IllegalTransactionState { reason: String },

    /// Any other provider failure.
    #[error("relational access failed: {reason}")]
    Execution { reason: String },
}

impl AccessError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, AccessError::Deadlock { .. })
    }
}

/// Result type alias for relational access operations.
pub type AccessResult<T> = Result<T, AccessError>;

/// A single column value, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    Bytes(Vec<u8>),
    Integer(i64),
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(value: &[u8]) -> Self {
        SqlValue::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Bytes(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(value: Option<i64>) -> Self {
        value.map(SqlValue::Integer).unwrap_or(SqlValue::Null)
    }
}

/// Named statement parameters.
///
/// Statement shapes omit absent predicates entirely, so [`ParamMap::set_opt`]
/// drops `None` values instead of binding null.
#[derive(Debug, Clone, Default)]
pub struct ParamMap(Vec<(&'static str, SqlValue)>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.0.push((column, value.into()));
        self
    }

    /// Binds the parameter only when a value is present.
    pub fn set_opt(self, column: &'static str, value: Option<impl Into<SqlValue>>) -> Self {
        match value {
            Some(value) => self.set(column, value),
            None => self,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SqlValue)> {
        self.0.iter().map(|(name, value)| (*name, value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One fetched row, addressed by column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row(HashMap<String, SqlValue>);

impl Row {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, SqlValue)>) -> Self {
        Self(pairs.into_iter().collect())
    }

    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.0.get(column)
    }

    fn required(&self, column: &str) -> AccessResult<&SqlValue> {
        self.value(column).ok_or_else(|| AccessError::Execution {
            reason: format!("result row is missing column {column}"),
        })
    }

    /// Reads a text column; byte columns are accepted when valid UTF-8.
    pub fn text(&self, column: &str) -> AccessResult<&str> {
        match self.required(column)? {
            SqlValue::Text(text) => Ok(text),
            SqlValue::Bytes(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| AccessError::Execution {
                    reason: format!("column {column} holds non-UTF-8 bytes"),
                })
            }
            other => Err(AccessError::Execution {
                reason: format!("column {column} holds {other:?}, expected text"),
            }),
        }
    }

    /// Reads a byte column; text columns are accepted as raw bytes.
    pub fn bytes(&self, column: &str) -> AccessResult<&[u8]> {
        match self.required(column)? {
            SqlValue::Bytes(bytes) => Ok(bytes),
            SqlValue::Text(text) => Ok(text.as_bytes()),
            other => Err(AccessError::Execution {
                reason: format!("column {column} holds {other:?}, expected bytes"),
            }),
        }
    }

    /// Reads a nullable integer column.
    pub fn integer_opt(&self, column: &str) -> AccessResult<Option<i64>> {
        match self.required(column)? {
            SqlValue::Integer(value) => Ok(Some(*value)),
            SqlValue::Null => Ok(None),
            other => Err(AccessError::Execution {
                reason: format!("column {column} holds {other:?}, expected integer"),
            }),
        }
    }
}

/// Rows produced by one statement execution.
#[derive(Debug, Default)]
pub struct ResultSet {
    rows: VecDeque<Row>,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    /// Fetches the next row, if any.
    pub fn fetch(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Fetches all remaining rows.
    pub fn fetch_all(self) -> Vec<Row> {
        self.rows.into()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A prepared statement, executable any number of times.
pub trait Statement {
    fn execute(&mut self, params: &ParamMap) -> AccessResult<ResultSet>;
}

/// Column type classes the cache schema needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Bounded binary, up to `length` bytes.
    Binary(u32),
    /// Unbounded binary, up to `max_size` bytes.
    Blob(u64),
    /// Integer of the given bit width.
    Integer(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn binary(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Binary(length),
            nullable: true,
        }
    }

    pub fn blob(name: impl Into<String>, max_size: u64) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Blob(max_size),
            nullable: true,
        }
    }

    pub fn integer(name: impl Into<String>, width: u8) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Integer(width),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Primary,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub kind: IndexKind,
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn primary<const N: usize>(columns: [&str; N]) -> Self {
        Self {
            kind: IndexKind::Primary,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn index<const N: usize>(columns: [&str; N]) -> Self {
        Self {
            kind: IndexKind::Index,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Table definition handed to [`RelationalAccess::create_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// The capability the cache engine consumes: parametrized SQL execution,
/// transaction control and schema introspection/DDL.
///
/// Implementations must be shareable across threads; concurrent callers
/// are coordinated solely by the database's transaction isolation.
pub trait RelationalAccess: Send + Sync {
    /// Prepares a statement for later execution.
    fn prepare(&self, sql: &str) -> AccessResult<Box<dyn Statement>>;

    /// Opens a transaction. Fails if one is already open on this
    /// connection.
    fn begin_transaction(&self, read_only: bool) -> AccessResult<()>;

    fn commit(&self) -> AccessResult<()>;

    fn rollback(&self) -> AccessResult<()>;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Whether `table_name` exists in the schema catalog.
    fn contains_table(&self, table_name: &str) -> AccessResult<bool>;

    /// Creates a table. Not idempotent: creating an existing table fails
    /// with [`AccessError::DuplicateSchemaElement`].
    fn create_table(&self, spec: &TableSpec) -> AccessResult<()>;

    fn drop_table(&self, table_name: &str) -> AccessResult<()>;

    /// All table names in the schema catalog.
    fn table_names(&self) -> AccessResult<Vec<String>>;

    /// Human-readable identifier of the underlying data source, used in
    /// diagnostics.
    fn source_name(&self) -> String;
}
