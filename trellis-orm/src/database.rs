//! # Database Module
//!
//! This module provides the core database connection for Trellis ORM.
//! It owns the SQLite connection pool and the transaction slot, binds [`Value`]s into
//! statements and decodes rows back into [`Record`]s.

// ============================================================================
// External Crate Imports
// ============================================================================

use futures::future::BoxFuture;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::naming::quote;
use crate::transaction::TransactionSlot;
use crate::{Record, Result, Value};

// ============================================================================
// Database Struct
// ============================================================================

/// Handle to the store.
///
/// `Database` is cheap to clone; clones share the pool, the transaction slot and the
/// statement counter. While a transaction is open, every statement issued through any
/// clone runs inside it.
#[derive(Debug, Clone)]
pub struct Database {
    /// The underlying SQLx connection pool
    pub(crate) pool: SqlitePool,
    /// The open transaction, if any
    pub(crate) tx: TransactionSlot,
    statements: Arc<AtomicU64>,
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

// ============================================================================
// Database Implementation
// ============================================================================

impl Database {
    /// Creates a new DatabaseBuilder for configuring the connection.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Connects to a database using the provided connection string.
    pub async fn connect(url: &str) -> Result<Self> {
        DatabaseBuilder::new().connect(url).await
    }

    pub(crate) fn from_pool(pool: SqlitePool) -> Self {
        Self { pool, tx: Arc::new(Mutex::new(None)), statements: Arc::new(AtomicU64::new(0)) }
    }

    /// Creates a raw SQL query.
    pub fn raw(&self, sql: impl Into<String>) -> RawQuery<'_, Self> {
        RawQuery::new(self, sql)
    }

    /// Number of statements issued so far through this handle and its clones.
    pub fn statement_count(&self) -> u64 {
        self.statements.load(Ordering::SeqCst)
    }

    fn record_statement(&self, sql: &str) {
        self.statements.fetch_add(1, Ordering::SeqCst);
        log::debug!("{sql}");
    }

    /// Checks if a table exists in the database.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let params = [Value::from(table)];
        let row = self
            .fetch_optional("SELECT count(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?", &params)
            .await?;
        Ok(row.and_then(|r| r.get("n").and_then(Value::as_i64)).unwrap_or(0) > 0)
    }

    /// Returns the physical columns of a table, empty when the table does not exist.
    pub async fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>> {
        let rows = self.fetch_all(&format!("PRAGMA table_info({})", quote(table)), &[]).await?;
        Ok(rows
            .into_iter()
            .map(|row| TableColumn {
                name: row.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                declared_type: row.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
                not_null: row.get("notnull").and_then(Value::as_i64).unwrap_or(0) != 0,
                primary_key: row.get("pk").and_then(Value::as_i64).unwrap_or(0) != 0,
            })
            .collect())
    }

    /// Returns the names of the indexes of a table.
    pub async fn table_indexes(&self, table: &str) -> Result<Vec<String>> {
        let rows = self.fetch_all(&format!("PRAGMA index_list({})", quote(table)), &[]).await?;
        Ok(rows.into_iter().filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string)).collect())
    }
}

// ============================================================================
// DatabaseBuilder Struct
// ============================================================================

/// Connection settings for [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    max_connections: u32,
    create_if_missing: bool,
    tuned: bool,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self { max_connections: 5, create_if_missing: true, tuned: false }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Applies the performance pragmas: 64 MiB page cache, in-memory temp store,
    /// `synchronous = NORMAL` and write-ahead journaling.
    pub fn performance_pragmas(mut self, enabled: bool) -> Self {
        self.tuned = enabled;
        self
    }

    pub async fn connect(self, url: &str) -> Result<Database> {
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(self.create_if_missing);
        if self.tuned {
            options = options
                .pragma("cache_size", "-64000")
                .pragma("temp_store", "MEMORY")
                .synchronous(SqliteSynchronous::Normal)
                .journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new().max_connections(self.max_connections).connect_with(options).await?;
        log::info!("connected to {url} (max {} connections)", self.max_connections);
        Ok(Database::from_pool(pool))
    }
}

// ============================================================================
// Binding and decoding
// ============================================================================

pub(crate) fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

pub(crate) fn decode_row(row: &SqliteRow) -> Result<Record> {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        let (is_null, storage) = {
            let raw = row.try_get_raw(index)?;
            (raw.is_null(), raw.type_info().name().to_ascii_uppercase())
        };
        let value = if is_null {
            Value::Null
        } else {
            match storage.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "INT8" | "BOOLEAN" => Value::Integer(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Real(row.try_get_unchecked::<f64, _>(index)?),
                "BLOB" => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

// ============================================================================
// Connection Trait
// ============================================================================

/// Statement execution against the store.
pub trait Connection: Send + Sync {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<ExecOutcome>>;
    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Record>>>;
    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Record>>>;
}

impl Connection for Database {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<ExecOutcome>> {
        Box::pin(async move {
            self.record_statement(sql);
            let query = bind_values(sqlx::query(sql), params);
            let mut slot = self.tx.lock().await;
            let result = match slot.as_mut() {
                Some(tx) => query.execute(&mut **tx).await?,
                None => query.execute(&self.pool).await?,
            };
            Ok(ExecOutcome { rows_affected: result.rows_affected(), last_insert_id: result.last_insert_rowid() })
        })
    }

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Record>>> {
        Box::pin(async move {
            self.record_statement(sql);
            let query = bind_values(sqlx::query(sql), params);
            let mut slot = self.tx.lock().await;
            let rows = match slot.as_mut() {
                Some(tx) => query.fetch_all(&mut **tx).await?,
                None => query.fetch_all(&self.pool).await?,
            };
            rows.iter().map(decode_row).collect()
        })
    }

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Record>>> {
        Box::pin(async move {
            self.record_statement(sql);
            let query = bind_values(sqlx::query(sql), params);
            let mut slot = self.tx.lock().await;
            let row = match slot.as_mut() {
                Some(tx) => query.fetch_optional(&mut **tx).await?,
                None => query.fetch_optional(&self.pool).await?,
            };
            row.as_ref().map(decode_row).transpose()
        })
    }
}

// ============================================================================
// Raw SQL Query Builder
// ============================================================================

/// Raw SQL with positional `?` parameters.
///
/// # Example
///
/// ```rust,ignore
/// let rows = db.raw("SELECT * FROM orders WHERE total > ?").bind(100).fetch_all().await?;
/// ```
pub struct RawQuery<'a, C> {
    conn: &'a C,
    sql: String,
    params: Vec<Value>,
}

impl<'a, C> RawQuery<'a, C>
where
    C: Connection,
{
    pub(crate) fn new(conn: &'a C, sql: impl Into<String>) -> Self {
        Self { conn, sql: sql.into(), params: Vec::new() }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub async fn fetch_all(self) -> Result<Vec<Record>> {
        self.conn.fetch_all(&self.sql, &self.params).await
    }

    pub async fn fetch_optional(self) -> Result<Option<Record>> {
        self.conn.fetch_optional(&self.sql, &self.params).await
    }

    /// Value of a single-column query, `Value::Null` when no row matched.
    pub async fn fetch_scalar(self) -> Result<Value> {
        let row = self.conn.fetch_optional(&self.sql, &self.params).await?;
        Ok(row.and_then(|r| r.into_values().next()).unwrap_or_default())
    }

    /// Executes the statement and returns the number of affected rows.
    pub async fn execute(self) -> Result<u64> {
        Ok(self.conn.execute(&self.sql, &self.params).await?.rows_affected)
    }
}
