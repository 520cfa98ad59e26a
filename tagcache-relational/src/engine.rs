//! Characteristic-indexed cache engine.
//!
//! Maps cache entries identified by `(name, characteristics)` onto two
//! tables: a data table holding one row per entry, and a characteristic
//! table holding one row per individual characteristic pair of every
//! entry with more than one characteristic. The characteristic table is
//! an inverted index: it answers "which entries carry this pair" without
//! scanning the data table, which is what makes partial-match lookup and
//! invalidation affordable.
//!
//! Invariant: an entry with `k > 1` characteristics owns exactly `k`
//! index rows; an entry with `k <= 1` owns none (its single serialized
//! characteristic set is matched directly through the data table's own
//! index). Index rows are written and deleted in the same transaction as
//! their owning data row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use tagcache_core::{Characteristics, PayloadCodec};

use crate::access::{
    AccessError, AccessResult, ColumnSpec, IndexSpec, ParamMap, RelationalAccess, Row, TableSpec,
};

pub const NAME_COLUMN: &str = "name";
pub const CHARACTERISTICS_COLUMN: &str = "characteristics";
pub const CHARACTERISTIC_COLUMN: &str = "characteristic";
pub const DATA_COLUMN: &str = "data";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const EXPIRES_AT_COLUMN: &str = "expires_at";

pub const MAX_LENGTH: u32 = 255;
pub const MAX_TEXT_SIZE: u64 = 134_217_720;

/// Size class of the payload column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataSize {
    /// Bounded binary column, up to [`MAX_LENGTH`] bytes.
    String,
    /// Unbounded blob column, up to [`MAX_TEXT_SIZE`] bytes.
    #[default]
    Text,
}

/// One raw data-table row. Characteristics and payload stay in their
/// encoded form; the store decodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRow {
    pub name: String,
    pub characteristics: Vec<u8>,
    pub data: Vec<u8>,
    pub created_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl EngineRow {
    fn from_row(row: &Row) -> AccessResult<Self> {
        Ok(Self {
            name: row.text(NAME_COLUMN)?.to_string(),
            characteristics: row.bytes(CHARACTERISTICS_COLUMN)?.to_vec(),
            data: row.bytes(DATA_COLUMN)?.to_vec(),
            created_at: row.integer_opt(CREATED_AT_COLUMN)?,
            expires_at: row.integer_opt(EXPIRES_AT_COLUMN)?,
        })
    }

    fn is_expired_by(&self, expired_by_time: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= expired_by_time)
    }
}

/// The cache engine bound to one data/characteristic table pair.
///
/// Not safe to share across differently named tables: one engine owns
/// exactly one pair. Statement text for the hot shapes is memoized after
/// first construction.
pub struct RelationalCacheEngine {
    access: Arc<dyn RelationalAccess>,
    data_table_name: String,
    characteristic_table_name: String,
    data_size: DataSize,
    codec: PayloadCodec,
    data_select_sql: OnceCell<String>,
    data_upsert_sql: OnceCell<String>,
    data_delete_sql: OnceCell<String>,
    characteristic_select_sql: OnceCell<String>,
    characteristic_insert_sql: OnceCell<String>,
    characteristic_delete_sql: OnceCell<String>,
}

impl RelationalCacheEngine {
    pub fn new(
        access: Arc<dyn RelationalAccess>,
        data_table_name: impl Into<String>,
        characteristic_table_name: impl Into<String>,
        data_size: DataSize,
        codec: PayloadCodec,
    ) -> Self {
        Self {
            access,
            data_table_name: data_table_name.into(),
            characteristic_table_name: characteristic_table_name.into(),
            data_size,
            codec,
            data_select_sql: OnceCell::new(),
            data_upsert_sql: OnceCell::new(),
            data_delete_sql: OnceCell::new(),
            characteristic_select_sql: OnceCell::new(),
            characteristic_insert_sql: OnceCell::new(),
            characteristic_delete_sql: OnceCell::new(),
        }
    }

    pub fn data_table_name(&self) -> &str {
        &self.data_table_name
    }

    pub fn characteristic_table_name(&self) -> &str {
        &self.characteristic_table_name
    }

    // ------------------------------------------------------------------
    // Statement text
    // ------------------------------------------------------------------

    fn data_select_sql(&self, name_included: bool, characteristics_included: bool) -> String {
        if name_included && characteristics_included {
            return self
                .data_select_sql
                .get_or_init(|| build_select_sql(&self.data_table_name, &[NAME_COLUMN, CHARACTERISTICS_COLUMN]))
                .clone();
        }

        let mut eq_columns = Vec::new();
        if name_included {
            eq_columns.push(NAME_COLUMN);
        }
        if characteristics_included {
            eq_columns.push(CHARACTERISTICS_COLUMN);
        }
        build_select_sql(&self.data_table_name, &eq_columns)
    }

    fn data_upsert_sql(&self) -> String {
        self.data_upsert_sql
            .get_or_init(|| {
                format!(
                    "INSERT INTO {table} ({name}, {chars}, {data}, {created}, {expires}) \
                     VALUES (:{name_p}, :{chars_p}, :{data_p}, :{created_p}, :{expires_p}) \
                     ON CONFLICT ({name}, {chars}) DO UPDATE SET \
                     {data} = excluded.{data}, {created} = excluded.{created}, \
                     {expires} = excluded.{expires}",
                    table = quote_ident(&self.data_table_name),
                    name = quote_ident(NAME_COLUMN),
                    chars = quote_ident(CHARACTERISTICS_COLUMN),
                    data = quote_ident(DATA_COLUMN),
                    created = quote_ident(CREATED_AT_COLUMN),
                    expires = quote_ident(EXPIRES_AT_COLUMN),
                    name_p = NAME_COLUMN,
                    chars_p = CHARACTERISTICS_COLUMN,
                    data_p = DATA_COLUMN,
                    created_p = CREATED_AT_COLUMN,
                    expires_p = EXPIRES_AT_COLUMN,
                )
            })
            .clone()
    }

    fn data_delete_sql(
        &self,
        name_included: bool,
        characteristics_included: bool,
        created_by_time_included: bool,
        expired_by_time_included: bool,
    ) -> String {
        let hot_shape = name_included
            && characteristics_included
            && !created_by_time_included
            && !expired_by_time_included;
        if hot_shape {
            return self
                .data_delete_sql
                .get_or_init(|| {
                    build_delete_sql(
                        &self.data_table_name,
                        &[NAME_COLUMN, CHARACTERISTICS_COLUMN],
                        &[],
                    )
                })
                .clone();
        }

        common_delete_sql(
            &self.data_table_name,
            name_included,
            characteristics_included,
            created_by_time_included,
            expired_by_time_included,
        )
    }

    fn characteristic_select_sql(&self, name_included: bool, characteristic_included: bool) -> String {
        if name_included && characteristic_included {
            return self
                .characteristic_select_sql
                .get_or_init(|| {
                    build_select_sql(
                        &self.characteristic_table_name,
                        &[NAME_COLUMN, CHARACTERISTIC_COLUMN],
                    )
                })
                .clone();
        }

        let mut eq_columns = Vec::new();
        if name_included {
            eq_columns.push(NAME_COLUMN);
        }
        if characteristic_included {
            eq_columns.push(CHARACTERISTIC_COLUMN);
        }
        build_select_sql(&self.characteristic_table_name, &eq_columns)
    }

    fn characteristic_insert_sql(&self) -> String {
        self.characteristic_insert_sql
            .get_or_init(|| {
                format!(
                    "INSERT INTO {table} ({name}, {chars}, {pair}, {created}, {expires}) \
                     VALUES (:{name_p}, :{chars_p}, :{pair_p}, :{created_p}, :{expires_p})",
                    table = quote_ident(&self.characteristic_table_name),
                    name = quote_ident(NAME_COLUMN),
                    chars = quote_ident(CHARACTERISTICS_COLUMN),
                    pair = quote_ident(CHARACTERISTIC_COLUMN),
                    created = quote_ident(CREATED_AT_COLUMN),
                    expires = quote_ident(EXPIRES_AT_COLUMN),
                    name_p = NAME_COLUMN,
                    chars_p = CHARACTERISTICS_COLUMN,
                    pair_p = CHARACTERISTIC_COLUMN,
                    created_p = CREATED_AT_COLUMN,
                    expires_p = EXPIRES_AT_COLUMN,
                )
            })
            .clone()
    }

    fn characteristic_delete_sql(
        &self,
        name_included: bool,
        characteristics_included: bool,
        created_by_time_included: bool,
        expired_by_time_included: bool,
    ) -> String {
        let hot_shape = name_included
            && characteristics_included
            && !created_by_time_included
            && !expired_by_time_included;
        if hot_shape {
            return self
                .characteristic_delete_sql
                .get_or_init(|| {
                    build_delete_sql(
                        &self.characteristic_table_name,
                        &[NAME_COLUMN, CHARACTERISTICS_COLUMN],
                        &[],
                    )
                })
                .clone();
        }

        common_delete_sql(
            &self.characteristic_table_name,
            name_included,
            characteristics_included,
            created_by_time_included,
            expired_by_time_included,
        )
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    fn encode_characteristics(&self, characteristics: &Characteristics) -> AccessResult<Vec<u8>> {
        self.codec
            .encode(characteristics)
            .map_err(|err| AccessError::Execution {
                reason: err.to_string(),
            })
    }

    fn split_and_encode(
        &self,
        characteristic_needles: Option<&Characteristics>,
    ) -> AccessResult<Vec<Vec<u8>>> {
        let Some(needles) = characteristic_needles else {
            return Ok(Vec::new());
        };

        needles
            .split()
            .iter()
            .map(|pair| self.encode_characteristics(pair))
            .collect()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    fn ensure_not_in_transaction(&self) -> AccessResult<()> {
        if !self.access.in_transaction() {
            return Ok(());
        }

        Err(AccessError::IllegalTransactionState {
            reason: format!(
                "connection {} is already in a transaction, which indicates it is managed \
                 by the caller; the cache engine must be able to manage its connection on its own",
                self.access.source_name()
            ),
        })
    }

    /// Runs `work` inside an engine-managed transaction.
    ///
    /// The transaction is rolled back on any failure. Deadlocks are
    /// retried up to two more times (three attempts in total); every
    /// other error propagates immediately.
    fn exec_in_transaction<R>(
        &self,
        read_only: bool,
        work: impl Fn() -> AccessResult<R>,
    ) -> AccessResult<R> {
        self.ensure_not_in_transaction()?;

        let mut attempt = 0;
        loop {
            if !self.access.in_transaction() {
                self.access.begin_transaction(read_only)?;
            }

            let outcome = work().and_then(|value| self.access.commit().map(|()| value));
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.access.in_transaction() {
                self.access.rollback()?;
            }

            if attempt >= 2 || !err.is_deadlock() {
                return Err(err);
            }

            attempt += 1;
            warn!(attempt, error = %err, "transaction deadlocked, retrying");
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Writes or overwrites one entry and rebuilds its index rows.
    pub fn write(
        &self,
        name: &str,
        characteristics: &Characteristics,
        data: &[u8],
        created_at: i64,
        expires_at: Option<i64>,
    ) -> AccessResult<()> {
        let characteristics_bytes = self.encode_characteristics(characteristics)?;

        self.exec_in_transaction(false, || {
            self.upsert_into_data_table(name, &characteristics_bytes, data, created_at, expires_at)?;
            self.delete_from_characteristic_table(Some(name), Some(&characteristics_bytes), None, None)?;
            if characteristics.len() > 1 {
                self.insert_into_characteristic_table(
                    name,
                    &characteristics_bytes,
                    characteristics,
                    created_at,
                    expires_at,
                )?;
            }
            Ok(())
        })
    }

    /// Reads one entry by exact identity.
    ///
    /// A row expired as of `expired_by_time` counts as absent and
    /// triggers an eager purge of all expired rows.
    pub fn read(
        &self,
        name: &str,
        characteristics: &Characteristics,
        expired_by_time: i64,
    ) -> AccessResult<Option<EngineRow>> {
        let characteristics_bytes = self.encode_characteristics(characteristics)?;
        let rows = self.select_from_data_table(Some(name), Some(&characteristics_bytes))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let row = EngineRow::from_row(row)?;

        if row.is_expired_by(expired_by_time) {
            debug!(name, "entry expired, purging expired rows");
            self.delete_expired_by_time(expired_by_time)?;
            return Ok(None);
        }

        Ok(Some(row))
    }

    /// Finds entries by optional name and optional characteristic needles.
    ///
    /// Needle matching unions two result sets: data rows whose full
    /// characteristic serialization equals the needle set, and rows found
    /// through the characteristic table where every needle pair was hit.
    pub fn find_by(
        &self,
        name_needle: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
        expired_by_time: i64,
    ) -> AccessResult<Vec<EngineRow>> {
        let characteristics_bytes = match characteristic_needles {
            Some(needles) => Some(self.encode_characteristics(needles)?),
            None => None,
        };
        let needle_bytes = self.split_and_encode(characteristic_needles)?;

        let raw_rows = self.exec_in_transaction(true, || {
            let mut rows =
                self.select_from_data_table(name_needle, characteristics_bytes.as_deref())?;

            if needle_bytes.is_empty() {
                return Ok(rows);
            }

            for (name, owner_characteristics) in
                self.select_from_characteristic_table(name_needle, &needle_bytes)?
            {
                rows.extend(
                    self.select_from_data_table(Some(&name), Some(&owner_characteristics))?,
                );
            }
            Ok(rows)
        })?;

        let rows = raw_rows
            .iter()
            .map(EngineRow::from_row)
            .collect::<AccessResult<Vec<_>>>()?;

        // an entry whose characteristics equal the whole needle set is
        // selected by both paths; the result is a union, not a bag
        let mut seen = HashSet::new();
        let rows: Vec<EngineRow> = rows
            .into_iter()
            .filter(|row| seen.insert((row.name.clone(), row.characteristics.clone())))
            .collect();

        let (live_rows, expired_rows): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .partition(|row| !row.is_expired_by(expired_by_time));

        if !expired_rows.is_empty() {
            debug!(
                expired = expired_rows.len(),
                "query touched expired entries, purging"
            );
            self.delete_expired_by_time(expired_by_time)?;
        }

        Ok(live_rows)
    }

    /// Deletes exactly one entry by identity.
    pub fn delete(&self, name: &str, characteristics: &Characteristics) -> AccessResult<()> {
        let characteristics_bytes = self.encode_characteristics(characteristics)?;

        self.exec_in_transaction(false, || {
            self.delete_from_data_table(Some(name), Some(&characteristics_bytes), None, None)?;
            self.delete_from_characteristic_table(Some(name), Some(&characteristics_bytes), None, None)
        })
    }

    /// Deletes every entry matched by the needle query, in one
    /// transaction across both tables.
    pub fn delete_by(
        &self,
        name_needle: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
    ) -> AccessResult<()> {
        let characteristics_bytes = match characteristic_needles {
            Some(needles) => Some(self.encode_characteristics(needles)?),
            None => None,
        };
        let needle_bytes = self.split_and_encode(characteristic_needles)?;

        self.exec_in_transaction(false, || {
            self.delete_from_data_table(name_needle, characteristics_bytes.as_deref(), None, None)?;
            self.delete_from_characteristic_table(
                name_needle,
                characteristics_bytes.as_deref(),
                None,
                None,
            )?;

            if needle_bytes.is_empty() {
                return Ok(());
            }

            for (name, owner_characteristics) in
                self.select_from_characteristic_table(name_needle, &needle_bytes)?
            {
                self.delete_from_data_table(Some(&name), Some(&owner_characteristics), None, None)?;
                self.delete_from_characteristic_table(
                    Some(&name),
                    Some(&owner_characteristics),
                    None,
                    None,
                )?;
            }
            Ok(())
        })
    }

    /// Deletes every row whose expiry lies at or before `expired_by_time`.
    pub fn delete_expired_by_time(&self, expired_by_time: i64) -> AccessResult<()> {
        self.exec_in_transaction(false, || {
            self.delete_from_data_table(None, None, None, Some(expired_by_time))?;
            self.delete_from_characteristic_table(None, None, None, Some(expired_by_time))
        })
    }

    /// Deletes every row created at or before `created_by_time`.
    pub fn delete_created_by_time(&self, created_by_time: i64) -> AccessResult<()> {
        self.exec_in_transaction(false, || {
            self.delete_from_data_table(None, None, Some(created_by_time), None)?;
            self.delete_from_characteristic_table(None, None, Some(created_by_time), None)
        })
    }

    /// Unconditionally empties both tables.
    pub fn clear(&self) -> AccessResult<()> {
        self.delete_from_data_table(None, None, None, None)?;
        self.delete_from_characteristic_table(None, None, None, None)
    }

    // ------------------------------------------------------------------
    // Row access
    // ------------------------------------------------------------------

    fn select_from_data_table(
        &self,
        name: Option<&str>,
        characteristics: Option<&[u8]>,
    ) -> AccessResult<Vec<Row>> {
        let mut stmt = self
            .access
            .prepare(&self.data_select_sql(name.is_some(), characteristics.is_some()))?;
        let params = ParamMap::new()
            .set_opt(NAME_COLUMN, name)
            .set_opt(CHARACTERISTICS_COLUMN, characteristics);
        Ok(stmt.execute(&params)?.fetch_all())
    }

    fn upsert_into_data_table(
        &self,
        name: &str,
        characteristics: &[u8],
        data: &[u8],
        created_at: i64,
        expires_at: Option<i64>,
    ) -> AccessResult<()> {
        let mut stmt = self.access.prepare(&self.data_upsert_sql())?;
        stmt.execute(
            &ParamMap::new()
                .set(NAME_COLUMN, name)
                .set(CHARACTERISTICS_COLUMN, characteristics)
                .set(DATA_COLUMN, data)
                .set(CREATED_AT_COLUMN, created_at)
                .set(EXPIRES_AT_COLUMN, expires_at),
        )?;
        Ok(())
    }

    fn delete_from_data_table(
        &self,
        name: Option<&str>,
        characteristics: Option<&[u8]>,
        created_by_time: Option<i64>,
        expired_by_time: Option<i64>,
    ) -> AccessResult<()> {
        let mut stmt = self.access.prepare(&self.data_delete_sql(
            name.is_some(),
            characteristics.is_some(),
            created_by_time.is_some(),
            expired_by_time.is_some(),
        ))?;
        stmt.execute(
            &ParamMap::new()
                .set_opt(NAME_COLUMN, name)
                .set_opt(CHARACTERISTICS_COLUMN, characteristics)
                .set_opt(CREATED_AT_COLUMN, created_by_time)
                .set_opt(EXPIRES_AT_COLUMN, expired_by_time),
        )?;
        Ok(())
    }

    fn insert_into_characteristic_table(
        &self,
        name: &str,
        characteristics: &[u8],
        characteristic_set: &Characteristics,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> AccessResult<()> {
        let mut stmt = self.access.prepare(&self.characteristic_insert_sql())?;
        for pair in characteristic_set.split() {
            let pair_bytes = self.encode_characteristics(&pair)?;
            stmt.execute(
                &ParamMap::new()
                    .set(NAME_COLUMN, name)
                    .set(CHARACTERISTICS_COLUMN, characteristics)
                    .set(CHARACTERISTIC_COLUMN, pair_bytes)
                    .set(CREATED_AT_COLUMN, created_at)
                    .set(EXPIRES_AT_COLUMN, expires_at),
            )?;
        }
        Ok(())
    }

    fn delete_from_characteristic_table(
        &self,
        name: Option<&str>,
        characteristics: Option<&[u8]>,
        created_by_time: Option<i64>,
        expired_by_time: Option<i64>,
    ) -> AccessResult<()> {
        let mut stmt = self.access.prepare(&self.characteristic_delete_sql(
            name.is_some(),
            characteristics.is_some(),
            created_by_time.is_some(),
            expired_by_time.is_some(),
        ))?;
        stmt.execute(
            &ParamMap::new()
                .set_opt(NAME_COLUMN, name)
                .set_opt(CHARACTERISTICS_COLUMN, characteristics)
                .set_opt(CREATED_AT_COLUMN, created_by_time)
                .set_opt(EXPIRES_AT_COLUMN, expired_by_time),
        )?;
        Ok(())
    }

    /// Resolves needle pairs to owning entries through the characteristic
    /// table.
    ///
    /// Each needle pair is queried separately; hits are counted per
    /// owning `(name, characteristics)`. Only owners hit once per needle
    /// pair carry all pairs, which emulates the AND-join over a needle
    /// set whose size is only known at runtime.
    fn select_from_characteristic_table(
        &self,
        name_needle: Option<&str>,
        characteristic_needle_bytes: &[Vec<u8>],
    ) -> AccessResult<Vec<(String, Vec<u8>)>> {
        debug_assert!(!characteristic_needle_bytes.is_empty());

        let mut stmt = self
            .access
            .prepare(&self.characteristic_select_sql(name_needle.is_some(), true))?;

        let needles_num = characteristic_needle_bytes.len();
        let mut hit_map: HashMap<(String, Vec<u8>), usize> = HashMap::new();
        let mut result_rows = Vec::new();

        for needle in characteristic_needle_bytes {
            let params = ParamMap::new()
                .set_opt(NAME_COLUMN, name_needle)
                .set(CHARACTERISTIC_COLUMN, needle.as_slice());
            let mut result = stmt.execute(&params)?;

            while let Some(row) = result.fetch() {
                let name = row.text(NAME_COLUMN)?.to_string();
                let characteristics = row.bytes(CHARACTERISTICS_COLUMN)?.to_vec();

                let hits = hit_map
                    .entry((name.clone(), characteristics.clone()))
                    .or_insert(0);
                *hits += 1;

                if *hits == needles_num {
                    result_rows.push((name, characteristics));
                    continue;
                }

                // each owner can be hit at most once per needle
                debug_assert!(*hits < needles_num);
            }
        }

        Ok(result_rows)
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    pub fn does_data_table_exist(&self) -> AccessResult<bool> {
        self.access.contains_table(&self.data_table_name)
    }

    /// Creates the data table. Fails with
    /// [`AccessError::DuplicateSchemaElement`] if it already exists.
    pub fn create_data_table(&self) -> AccessResult<()> {
        let data_column = match self.data_size {
            DataSize::String => ColumnSpec::binary(DATA_COLUMN, MAX_LENGTH).not_null(),
            DataSize::Text => ColumnSpec::blob(DATA_COLUMN, MAX_TEXT_SIZE).not_null(),
        };

        let spec = TableSpec::new(&self.data_table_name)
            .column(ColumnSpec::binary(NAME_COLUMN, MAX_LENGTH).not_null())
            .column(ColumnSpec::binary(CHARACTERISTICS_COLUMN, MAX_LENGTH).not_null())
            .column(data_column)
            .column(ColumnSpec::integer(CREATED_AT_COLUMN, 32))
            .column(ColumnSpec::integer(EXPIRES_AT_COLUMN, 32))
            .index(IndexSpec::primary([NAME_COLUMN, CHARACTERISTICS_COLUMN]))
            .index(IndexSpec::index([CHARACTERISTICS_COLUMN]))
            .index(IndexSpec::index([CREATED_AT_COLUMN]))
            .index(IndexSpec::index([EXPIRES_AT_COLUMN]));

        self.access.create_table(&spec)?;
        info!(table = %self.data_table_name, "created cache data table");
        Ok(())
    }

    pub fn does_characteristic_table_exist(&self) -> AccessResult<bool> {
        self.access.contains_table(&self.characteristic_table_name)
    }

    /// Creates the characteristic index table. Fails with
    /// [`AccessError::DuplicateSchemaElement`] if it already exists.
    pub fn create_characteristic_table(&self) -> AccessResult<()> {
        let spec = TableSpec::new(&self.characteristic_table_name)
            .column(ColumnSpec::binary(NAME_COLUMN, MAX_LENGTH).not_null())
            .column(ColumnSpec::binary(CHARACTERISTICS_COLUMN, MAX_LENGTH).not_null())
            .column(ColumnSpec::binary(CHARACTERISTIC_COLUMN, MAX_LENGTH).not_null())
            .column(ColumnSpec::integer(CREATED_AT_COLUMN, 32))
            .column(ColumnSpec::integer(EXPIRES_AT_COLUMN, 32))
            .index(IndexSpec::primary([
                NAME_COLUMN,
                CHARACTERISTICS_COLUMN,
                CHARACTERISTIC_COLUMN,
            ]))
            .index(IndexSpec::index([CHARACTERISTIC_COLUMN, NAME_COLUMN]))
            .index(IndexSpec::index([CREATED_AT_COLUMN]))
            .index(IndexSpec::index([EXPIRES_AT_COLUMN]));

        self.access.create_table(&spec)?;
        info!(table = %self.characteristic_table_name, "created cache characteristic table");
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn build_select_sql(table: &str, eq_columns: &[&str]) -> String {
    let mut sql = format!("SELECT * FROM {}", quote_ident(table));
    append_where(&mut sql, eq_columns, &[]);
    sql
}

fn build_delete_sql(table: &str, eq_columns: &[&str], le_columns: &[&str]) -> String {
    let mut sql = format!("DELETE FROM {}", quote_ident(table));
    append_where(&mut sql, eq_columns, le_columns);
    sql
}

fn common_delete_sql(
    table: &str,
    name_included: bool,
    characteristics_included: bool,
    created_by_time_included: bool,
    expired_by_time_included: bool,
) -> String {
    let mut eq_columns = Vec::new();
    if name_included {
        eq_columns.push(NAME_COLUMN);
    }
    if characteristics_included {
        eq_columns.push(CHARACTERISTICS_COLUMN);
    }

    let mut le_columns = Vec::new();
    if created_by_time_included {
        le_columns.push(CREATED_AT_COLUMN);
    }
    if expired_by_time_included {
        le_columns.push(EXPIRES_AT_COLUMN);
    }

    build_delete_sql(table, &eq_columns, &le_columns)
}

fn append_where(sql: &mut String, eq_columns: &[&str], le_columns: &[&str]) {
    let mut predicates: Vec<String> = eq_columns
        .iter()
        .map(|column| format!("{} = :{}", quote_ident(column), column))
        .collect();
    predicates.extend(
        le_columns
            .iter()
            .map(|column| format!("{} <= :{}", quote_ident(column), column)),
    );

    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::access::Statement;
    use crate::sqlite::SqliteAccess;

    fn characteristics(pairs: &[(&str, &str)]) -> Characteristics {
        pairs.iter().copied().collect()
    }

    fn engine_over(access: &SqliteAccess) -> RelationalCacheEngine {
        RelationalCacheEngine::new(
            Arc::new(access.clone()),
            "data",
            "characteristic",
            DataSize::String,
            PayloadCodec::Json,
        )
    }

    fn ready_engine(access: &SqliteAccess) -> RelationalCacheEngine {
        let engine = engine_over(access);
        engine.create_data_table().unwrap();
        engine.create_characteristic_table().unwrap();
        engine
    }

    fn select_all(access: &SqliteAccess, table: &str) -> Vec<Row> {
        let mut stmt = access
            .prepare(&format!("SELECT * FROM {}", quote_ident(table)))
            .unwrap();
        stmt.execute(&ParamMap::new()).unwrap().fetch_all()
    }

    fn encoded(characteristics: &Characteristics) -> Vec<u8> {
        PayloadCodec::Json.encode(characteristics).unwrap()
    }

    #[test]
    fn test_create_data_table() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = engine_over(&access);

        assert!(!engine.does_data_table_exist().unwrap());
        engine.create_data_table().unwrap();
        assert!(engine.does_data_table_exist().unwrap());
        assert!(!engine.does_characteristic_table_exist().unwrap());

        assert!(select_all(&access, "data").is_empty());
    }

    #[test]
    fn test_create_characteristic_table() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = engine_over(&access);

        assert!(!engine.does_characteristic_table_exist().unwrap());
        engine.create_characteristic_table().unwrap();
        assert!(engine.does_characteristic_table_exist().unwrap());
        assert!(!engine.does_data_table_exist().unwrap());

        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_create_table_twice_fails() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = engine_over(&access);

        engine.create_data_table().unwrap();
        assert!(matches!(
            engine.create_data_table().unwrap_err(),
            AccessError::DuplicateSchemaElement { .. }
        ));
    }

    #[test]
    fn test_write_single_characteristic_creates_no_index_rows() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("entry", &characteristics(&[("key", "value1")]), b"data1", 10, None)
            .unwrap();
        engine
            .write("entry", &characteristics(&[("key", "value2")]), b"data2", 10, None)
            .unwrap();

        let data_rows = select_all(&access, "data");
        assert_eq!(data_rows.len(), 2);
        assert_eq!(data_rows[0].text(NAME_COLUMN).unwrap(), "entry");
        assert_eq!(
            data_rows[0].bytes(CHARACTERISTICS_COLUMN).unwrap(),
            encoded(&characteristics(&[("key", "value1")])).as_slice()
        );
        assert_eq!(data_rows[0].bytes(DATA_COLUMN).unwrap(), b"data1");
        assert_eq!(data_rows[0].integer_opt(CREATED_AT_COLUMN).unwrap(), Some(10));
        assert_eq!(data_rows[0].integer_opt(EXPIRES_AT_COLUMN).unwrap(), None);

        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_write_multi_characteristic_fans_out_index_rows() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        let chars = characteristics(&[("key", "value"), ("o-key", "o-value"), ("to-key", "to-value")]);
        engine.write("entry", &chars, b"data", 10, Some(99)).unwrap();

        assert_eq!(select_all(&access, "data").len(), 1);

        let index_rows = select_all(&access, "characteristic");
        assert_eq!(index_rows.len(), 3);
        for row in &index_rows {
            assert_eq!(row.text(NAME_COLUMN).unwrap(), "entry");
            assert_eq!(
                row.bytes(CHARACTERISTICS_COLUMN).unwrap(),
                encoded(&chars).as_slice()
            );
            assert_eq!(row.integer_opt(EXPIRES_AT_COLUMN).unwrap(), Some(99));
        }
    }

    #[test]
    fn test_overwrite_keeps_row_counts_stable() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        let chars = characteristics(&[("a", "1"), ("b", "2")]);
        engine.write("entry", &chars, b"old", 10, None).unwrap();
        engine.write("entry", &chars, b"new", 20, None).unwrap();

        let data_rows = select_all(&access, "data");
        assert_eq!(data_rows.len(), 1);
        assert_eq!(data_rows[0].bytes(DATA_COLUMN).unwrap(), b"new");
        assert_eq!(data_rows[0].integer_opt(CREATED_AT_COLUMN).unwrap(), Some(20));

        assert_eq!(select_all(&access, "characteristic").len(), 2);
    }

    #[test]
    fn test_identity_ignores_characteristic_order() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("entry", &characteristics(&[("a", "1"), ("b", "2")]), b"first", 10, None)
            .unwrap();
        engine
            .write("entry", &characteristics(&[("b", "2"), ("a", "1")]), b"second", 10, None)
            .unwrap();

        assert_eq!(select_all(&access, "data").len(), 1);
        let row = engine
            .read("entry", &characteristics(&[("a", "1"), ("b", "2")]), 50)
            .unwrap()
            .unwrap();
        assert_eq!(row.data, b"second");
    }

    #[test]
    fn test_read_miss() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        assert!(engine
            .read("missing", &characteristics(&[("key", "value")]), 50)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_expiry_boundary_and_eager_purge() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        let chars = characteristics(&[("a", "1"), ("b", "2")]);
        engine.write("entry", &chars, b"data", 10, Some(100)).unwrap();

        // strictly before the expiry instant the entry is alive
        assert!(engine.read("entry", &chars, 99).unwrap().is_some());

        // at the expiry instant the entry is gone and both tables purged
        assert!(engine.read("entry", &chars, 100).unwrap().is_none());
        assert!(select_all(&access, "data").is_empty());
        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_find_by_name_only() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("a", &characteristics(&[("key", "v")]), b"data-a", 10, None)
            .unwrap();
        engine
            .write("b", &characteristics(&[("key", "v")]), b"data-b", 10, None)
            .unwrap();

        let rows = engine.find_by(Some("a"), None, 50).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, b"data-a");

        let all_rows = engine.find_by(None, None, 50).unwrap();
        assert_eq!(all_rows.len(), 2);
    }

    #[test]
    fn test_find_by_needles_has_and_semantics() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write(
                "entry",
                &characteristics(&[("key", "value"), ("o-key", "o-value")]),
                b"two",
                10,
                None,
            )
            .unwrap();
        engine
            .write(
                "entry",
                &characteristics(&[("key", "value"), ("o-key", "o-value"), ("to-key", "to-value")]),
                b"three",
                10,
                None,
            )
            .unwrap();

        let rows = engine
            .find_by(
                None,
                Some(&characteristics(&[("o-key", "o-value"), ("to-key", "to-value")])),
                50,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, b"three");
    }

    #[test]
    fn test_find_by_single_needle_matches_single_characteristic_entry_directly() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("entry", &characteristics(&[("key", "value")]), b"one", 10, None)
            .unwrap();
        engine
            .write(
                "entry",
                &characteristics(&[("key", "value"), ("o-key", "o-value")]),
                b"two",
                10,
                None,
            )
            .unwrap();

        let mut found: Vec<Vec<u8>> = engine
            .find_by(None, Some(&characteristics(&[("key", "value")])), 50)
            .unwrap()
            .into_iter()
            .map(|row| row.data)
            .collect();
        found.sort();
        assert_eq!(found, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_find_by_exact_needle_match_is_returned_once() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        let chars = characteristics(&[("o-key", "o-value"), ("to-key", "to-value")]);
        engine.write("entry", &chars, b"data", 10, None).unwrap();

        // matched directly by the full serialization AND through the
        // characteristic index
        let rows = engine.find_by(None, Some(&chars), 50).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_find_by_filters_and_purges_expired() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("entry", &characteristics(&[("key", "v1")]), b"fresh", 10, Some(100))
            .unwrap();
        engine
            .write("entry", &characteristics(&[("key", "v2")]), b"stale", 10, Some(20))
            .unwrap();

        let rows = engine.find_by(Some("entry"), None, 50).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, b"fresh");

        // the stale row was purged as a side effect
        assert_eq!(select_all(&access, "data").len(), 1);
    }

    #[test]
    fn test_delete_exact_identity() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        let chars = characteristics(&[("a", "1"), ("b", "2")]);
        engine.write("entry", &chars, b"data", 10, None).unwrap();
        engine
            .write("entry", &characteristics(&[("a", "1")]), b"other", 10, None)
            .unwrap();

        engine.delete("entry", &chars).unwrap();

        assert_eq!(select_all(&access, "data").len(), 1);
        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_delete_by_scenario() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("entry", &characteristics(&[("key", "value0")]), b"data0", 10, None)
            .unwrap();
        engine
            .write(
                "entry",
                &characteristics(&[("key", "value1"), ("o-key", "o-value")]),
                b"data1",
                10,
                None,
            )
            .unwrap();

        engine
            .delete_by(Some("entry"), Some(&characteristics(&[("key", "value0")])))
            .unwrap();

        let rows = engine.find_by(Some("entry"), None, 50).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, b"data1");
    }

    #[test]
    fn test_delete_by_needle_removes_index_rows_of_matches() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write(
                "entry",
                &characteristics(&[("key", "value"), ("o-key", "o-value")]),
                b"data",
                10,
                None,
            )
            .unwrap();

        engine
            .delete_by(None, Some(&characteristics(&[("o-key", "o-value")])))
            .unwrap();

        assert!(select_all(&access, "data").is_empty());
        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_delete_created_by_time() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("old", &characteristics(&[("a", "1"), ("b", "2")]), b"old", 10, None)
            .unwrap();
        engine
            .write("new", &characteristics(&[("a", "1")]), b"new", 30, None)
            .unwrap();

        engine.delete_created_by_time(10).unwrap();

        let data_rows = select_all(&access, "data");
        assert_eq!(data_rows.len(), 1);
        assert_eq!(data_rows[0].text(NAME_COLUMN).unwrap(), "new");
        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_clear_empties_both_tables() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        engine
            .write("a", &characteristics(&[("k1", "v1"), ("k2", "v2")]), b"x", 10, None)
            .unwrap();
        engine
            .write("b", &characteristics(&[("k1", "v1")]), b"y", 10, Some(99))
            .unwrap();

        engine.clear().unwrap();

        assert!(select_all(&access, "data").is_empty());
        assert!(select_all(&access, "characteristic").is_empty());
    }

    #[test]
    fn test_engine_refuses_caller_managed_transaction() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = ready_engine(&access);

        access.begin_transaction(false).unwrap();
        let err = engine
            .write("entry", &characteristics(&[("k", "v")]), b"data", 10, None)
            .unwrap_err();
        assert!(matches!(err, AccessError::IllegalTransactionState { .. }));
        access.rollback().unwrap();
    }

    #[test]
    fn test_statement_shapes() {
        let access = SqliteAccess::open_in_memory().unwrap();
        let engine = engine_over(&access);

        let full = engine.data_select_sql(true, true);
        assert!(full.contains("\"name\" = :name"));
        assert!(full.contains("\"characteristics\" = :characteristics"));
        // memoized shape is stable
        assert_eq!(full, engine.data_select_sql(true, true));

        let bare = engine.data_select_sql(false, false);
        assert!(!bare.contains("WHERE"));

        let delete = engine.data_delete_sql(false, false, true, true);
        assert!(delete.contains("\"created_at\" <= :created_at"));
        assert!(delete.contains("\"expires_at\" <= :expires_at"));
    }

    /// Delegates to SQLite but fails the first `failures` commits with a
    /// deadlock, rolling the transaction back like a real lock-victim
    /// abort would.
    struct DeadlockingAccess {
        inner: SqliteAccess,
        failures: AtomicUsize,
    }

    impl DeadlockingAccess {
        fn new(inner: SqliteAccess, failures: usize) -> Self {
            Self {
                inner,
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl RelationalAccess for DeadlockingAccess {
        fn prepare(&self, sql: &str) -> AccessResult<Box<dyn Statement>> {
            self.inner.prepare(sql)
        }

        fn begin_transaction(&self, read_only: bool) -> AccessResult<()> {
            self.inner.begin_transaction(read_only)
        }

        fn commit(&self) -> AccessResult<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                self.inner.rollback()?;
                return Err(AccessError::Deadlock {
                    reason: "simulated lock contention".to_string(),
                });
            }
            self.inner.commit()
        }

        fn rollback(&self) -> AccessResult<()> {
            self.inner.rollback()
        }

        fn in_transaction(&self) -> bool {
            self.inner.in_transaction()
        }

        fn contains_table(&self, table_name: &str) -> AccessResult<bool> {
            self.inner.contains_table(table_name)
        }

        fn create_table(&self, spec: &TableSpec) -> AccessResult<()> {
            self.inner.create_table(spec)
        }

        fn drop_table(&self, table_name: &str) -> AccessResult<()> {
            self.inner.drop_table(table_name)
        }

        fn table_names(&self) -> AccessResult<Vec<String>> {
            self.inner.table_names()
        }

        fn source_name(&self) -> String {
            self.inner.source_name()
        }
    }

    fn deadlocking_engine(access: &SqliteAccess, failures: usize) -> RelationalCacheEngine {
        RelationalCacheEngine::new(
            Arc::new(DeadlockingAccess::new(access.clone(), failures)),
            "data",
            "characteristic",
            DataSize::String,
            PayloadCodec::Json,
        )
    }

    #[test]
    fn test_deadlock_retried_twice_then_succeeds() {
        let access = SqliteAccess::open_in_memory().unwrap();
        ready_engine(&access);

        let engine = deadlocking_engine(&access, 2);
        engine
            .write("entry", &characteristics(&[("k", "v")]), b"data", 10, None)
            .unwrap();

        assert_eq!(select_all(&access, "data").len(), 1);
        assert!(!access.in_transaction());
    }

    #[test]
    fn test_deadlock_on_all_attempts_propagates() {
        let access = SqliteAccess::open_in_memory().unwrap();
        ready_engine(&access);

        let engine = deadlocking_engine(&access, 3);
        let err = engine
            .write("entry", &characteristics(&[("k", "v")]), b"data", 10, None)
            .unwrap_err();

        assert!(err.is_deadlock());
        assert!(select_all(&access, "data").is_empty());
        assert!(!access.in_transaction());
    }

    #[test]
    fn test_non_deadlock_error_is_not_retried() {
        let access = SqliteAccess::open_in_memory().unwrap();
        // tables never created: the first statement of the write fails
        let engine = engine_over(&access);

        let err = engine
            .write("entry", &characteristics(&[("k", "v")]), b"data", 10, None)
            .unwrap_err();
        assert!(matches!(err, AccessError::Execution { .. }));
        assert!(!access.in_transaction());
    }
}
