//! SQLite relational access provider.
//!
//! Backs the [`RelationalAccess`] boundary with a single `rusqlite`
//! connection. One `SqliteAccess` owns one connection; clones of the
//! handle share it, so transaction state is per-handle-group, matching
//! the one-connection-per-engine ownership model.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection, ToSql};

use crate::access::{
    AccessError, AccessResult, ColumnKind, IndexKind, ParamMap, RelationalAccess, ResultSet, Row,
    SqlValue, Statement, TableSpec,
};

/// Relational access over one SQLite connection.
#[derive(Clone)]
pub struct SqliteAccess {
    conn: Arc<Mutex<Connection>>,
    source_name: String,
}

impl SqliteAccess {
    /// Opens a private in-memory database.
    pub fn open_in_memory() -> AccessResult<Self> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            source_name: "sqlite::memory:".to_string(),
        })
    }

    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> AccessResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(classify)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            source_name: format!("sqlite:{}", path.display()),
        })
    }

    fn conn(&self) -> AccessResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AccessError::Execution {
            reason: "sqlite connection lock poisoned".to_string(),
        })
    }
}

impl RelationalAccess for SqliteAccess {
    fn prepare(&self, sql: &str) -> AccessResult<Box<dyn Statement>> {
        // Compile once up front so syntax errors surface at prepare time;
        // the compiled form stays in the connection's statement cache.
        {
            let conn = self.conn()?;
            conn.prepare_cached(sql).map_err(classify)?;
        }

        Ok(Box::new(SqliteStatement {
            conn: Arc::clone(&self.conn),
            sql: sql.to_string(),
        }))
    }

    fn begin_transaction(&self, _read_only: bool) -> AccessResult<()> {
        self.conn()?.execute_batch("BEGIN").map_err(classify)
    }

    fn commit(&self) -> AccessResult<()> {
        self.conn()?.execute_batch("COMMIT").map_err(classify)
    }

    fn rollback(&self) -> AccessResult<()> {
        self.conn()?.execute_batch("ROLLBACK").map_err(classify)
    }

    fn in_transaction(&self) -> bool {
        self.conn
            .lock()
            .map(|conn| !conn.is_autocommit())
            .unwrap_or(false)
    }

    fn contains_table(&self, table_name: &str) -> AccessResult<bool> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table_name],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(count > 0)
    }

    fn create_table(&self, spec: &TableSpec) -> AccessResult<()> {
        if self.contains_table(&spec.name)? {
            return Err(AccessError::DuplicateSchemaElement {
                name: spec.name.clone(),
            });
        }

        self.conn()?
            .execute_batch(&render_create_table(spec))
            .map_err(classify)
    }

    fn drop_table(&self, table_name: &str) -> AccessResult<()> {
        self.conn()?
            .execute_batch(&format!("DROP TABLE {}", quote_ident(table_name)))
            .map_err(classify)
    }

    fn table_names(&self) -> AccessResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(classify)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(names)
    }

    fn source_name(&self) -> String {
        self.source_name.clone()
    }
}

struct SqliteStatement {
    conn: Arc<Mutex<Connection>>,
    sql: String,
}

impl Statement for SqliteStatement {
    fn execute(&mut self, params: &ParamMap) -> AccessResult<ResultSet> {
        let conn = self.conn.lock().map_err(|_| AccessError::Execution {
            reason: "sqlite connection lock poisoned".to_string(),
        })?;
        let mut stmt = conn.prepare_cached(&self.sql).map_err(classify)?;

        let prefixed: Vec<(String, &dyn ToSql)> = params
            .iter()
            .map(|(name, value)| (format!(":{name}"), value as &dyn ToSql))
            .collect();
        let named: Vec<(&str, &dyn ToSql)> = prefixed
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(named.as_slice()).map_err(classify)?;
        let mut fetched = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut pairs = Vec::with_capacity(columns.len());
            for (index, column) in columns.iter().enumerate() {
                let value = match row.get_ref(index).map_err(classify)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(value) => SqlValue::Integer(value),
                    ValueRef::Real(value) => SqlValue::Text(value.to_string()),
                    ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).into_owned()),
                    ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
                };
                pairs.push((column.clone(), value));
            }
            fetched.push(Row::from_pairs(pairs));
        }

        Ok(ResultSet::new(fetched))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            SqlValue::Bytes(bytes) => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
            SqlValue::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
        })
    }
}

fn classify(err: rusqlite::Error) -> AccessError {
    if let rusqlite::Error::SqliteFailure(ref code, ref message) = err {
        if matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return AccessError::Deadlock {
                reason: message.clone().unwrap_or_else(|| code.to_string()),
            };
        }
    }
    AccessError::Execution {
        reason: err.to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_create_table(spec: &TableSpec) -> String {
    let mut defs: Vec<String> = spec
        .columns
        .iter()
        .map(|column| {
            let sql_type = match column.kind {
                ColumnKind::Binary(_) | ColumnKind::Blob(_) => "BLOB",
                ColumnKind::Integer(_) => "INTEGER",
            };
            format!(
                "{} {}{}",
                quote_ident(&column.name),
                sql_type,
                if column.nullable { "" } else { " NOT NULL" }
            )
        })
        .collect();

    for index in &spec.indexes {
        if index.kind == IndexKind::Primary {
            let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
            defs.push(format!("PRIMARY KEY ({})", columns.join(", ")));
        }
    }

    let mut sql = format!(
        "CREATE TABLE {} ({});\n",
        quote_ident(&spec.name),
        defs.join(", ")
    );

    for index in &spec.indexes {
        if index.kind != IndexKind::Index {
            continue;
        }
        let index_name = format!("{}_{}_idx", spec.name, index.columns.join("_"));
        let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(
            "CREATE INDEX {} ON {} ({});\n",
            quote_ident(&index_name),
            quote_ident(&spec.name),
            columns.join(", ")
        ));
    }

    sql
}
