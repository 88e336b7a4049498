//! Driver seam between the access facade and a concrete backend.
//!
//! The facade is generic over [`Connection`], so the same lifecycle, caching and
//! validation logic drives the sqlx-backed [`DbConnection`](super::DbConnection)
//! in production and scripted connections in tests. Native failures are always
//! reported as `sqlx::Error`.

use crate::models::{DatabaseType, Row, SqlParam};
use futures_util::stream::BoxStream;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

/// Fetch size that asks a driver to deliver rows one at a time instead of
/// materializing the whole result set.
pub const ROW_BY_ROW_FETCH_SIZE: i32 = i32::MIN;

/// Stream of decoded rows backed by an open cursor.
pub type RowCursor<'c> = BoxStream<'c, Result<Row, sqlx::Error>>;

/// Identity of a bound connection, used to key the statement cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// How a query result is pulled from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Forward-only, read-only cursor with the row-by-row fetch size sentinel.
    RowByRow,
    /// Driver defaults.
    Default,
}

impl FetchStrategy {
    /// Pick the strategy for a backend. MySQL materializes whole result sets
    /// unless told otherwise.
    pub fn resolve(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::MySQL => Self::RowByRow,
            DatabaseType::PostgreSQL | DatabaseType::SQLite => Self::Default,
        }
    }

    pub fn statement_config(self) -> StatementConfig {
        match self {
            Self::RowByRow => StatementConfig {
                forward_only: true,
                read_only: true,
                fetch_size: Some(ROW_BY_ROW_FETCH_SIZE),
                generated_key: None,
            },
            Self::Default => StatementConfig::default(),
        }
    }
}

/// Options a statement is compiled with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementConfig {
    pub forward_only: bool,
    pub read_only: bool,
    pub fetch_size: Option<i32>,
    /// Column whose generated value should be retrievable after execution.
    pub generated_key: Option<String>,
}

impl StatementConfig {
    pub fn returning_key(column: impl Into<String>) -> Self {
        Self {
            generated_key: Some(column.into()),
            ..Self::default()
        }
    }
}

/// A parameter ready to be bound to a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundParam {
    Value(SqlParam),
    /// Binary payload bound through the driver's large-object support.
    LargeObject(Vec<u8>),
}

impl From<SqlParam> for BoundParam {
    fn from(param: SqlParam) -> Self {
        Self::Value(param)
    }
}

impl From<&SqlParam> for BoundParam {
    fn from(param: &SqlParam) -> Self {
        Self::Value(param.clone())
    }
}

/// Reasons a binary value could not be wrapped as a large object.
#[derive(Debug, Error)]
pub enum LargeObjectError {
    #[error("large objects are not supported by this driver")]
    Unsupported,
    #[error("large object creation is not implemented by this driver")]
    Unimplemented,
    #[error("failed to bind large object: {0}")]
    Bind(#[source] sqlx::Error),
}

/// Result of executing a compiled statement.
#[derive(Debug)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// `Ok(None)` when no key was generated or none was requested; `Err` when
    /// the statement ran but its key could not be read.
    pub generated_key: Result<Option<i64>, sqlx::Error>,
}

impl ExecOutcome {
    pub fn without_key(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_key: Ok(None),
        }
    }
}

/// A compiled statement owned by one connection.
pub trait PreparedStatement: Send + Sync + 'static {
    fn sql(&self) -> &str;

    /// Column whose generated value the statement was compiled to return.
    fn key_column(&self) -> Option<&str> {
        None
    }

    /// Release backend resources held by the statement.
    fn close(self) -> Result<(), sqlx::Error>
    where
        Self: Sized;
}

/// A live physical connection.
///
/// Implementations are not internally synchronized: a connection is driven by
/// exactly one execution context at a time.
pub trait Connection: Send + 'static {
    type Statement: PreparedStatement;

    fn database_type(&self) -> DatabaseType;

    fn prepare(
        &mut self,
        sql: &str,
        config: &StatementConfig,
    ) -> impl Future<Output = Result<Self::Statement, sqlx::Error>> + Send;

    fn execute(
        &mut self,
        statement: &Self::Statement,
        params: &[BoundParam],
    ) -> impl Future<Output = Result<ExecOutcome, sqlx::Error>> + Send;

    /// Run SQL without preparing it; returns the affected row count.
    fn execute_unprepared(
        &mut self,
        sql: &str,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;

    /// Start a lazily evaluated query. Nothing is sent until the cursor is polled.
    fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        params: &'c [SqlParam],
        config: &StatementConfig,
    ) -> RowCursor<'c>;

    fn create_large_object(&mut self, bytes: &[u8]) -> Result<BoundParam, LargeObjectError>;

    fn begin(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Drop statements the connection compiled and kept for itself, so it can
    /// be handed back to a pool without carrying them along.
    fn clear_statements(&mut self) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
        async { Ok(()) }
    }

    fn close(self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

/// Something that hands out new physical connections, such as a configured
/// driver or an externally managed pool.
pub trait ConnectionSource: Send + Sync {
    type Connection: Connection;

    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, sqlx::Error>> + Send;

    /// Credential-free description used in logs and initialization errors.
    fn describe(&self) -> String;
}
