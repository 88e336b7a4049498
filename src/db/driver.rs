//! sqlx-backed implementation of the driver seam.
//!
//! Each backend keeps its own concrete sqlx connection type (no `Any` driver),
//! so full type support and backend-specific features such as generated-key
//! retrieval stay available.

use crate::db::connection::{
    BoundParam, Connection, ConnectionSource, ExecOutcome, LargeObjectError, PreparedStatement,
    RowCursor, StatementConfig,
};
use crate::db::params::{
    bind_mysql, bind_mysql_param, bind_postgres, bind_postgres_param, bind_sqlite,
    bind_sqlite_param,
};
use crate::db::sql;
use crate::db::types::DecodeRow;
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{DatabaseType, SqlParam, mask_url};
use futures_util::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPoolOptions, MySqlStatement};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgRow, PgStatement};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteStatement};
use sqlx::{ConnectOptions, Connection as SqlxConnection, MySqlPool, PgPool, Row as _, SqlitePool};
use std::str::FromStr;
use tracing::{debug, trace};

/// A single physical connection to one of the supported backends.
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl DbConnection {
    /// Open a connection. Credentials override whatever the URL carries;
    /// SQLite ignores them.
    pub async fn connect(
        db_type: DatabaseType,
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        match db_type {
            DatabaseType::MySQL => {
                let mut options = MySqlConnectOptions::from_str(url)?.charset("utf8mb4");
                if let Some(user) = user {
                    options = options.username(user);
                }
                if let Some(password) = password {
                    options = options.password(password);
                }
                Ok(Self::MySql(options.connect().await?))
            }
            DatabaseType::PostgreSQL => {
                let mut options = PgConnectOptions::from_str(url)?;
                if let Some(user) = user {
                    options = options.username(user);
                }
                if let Some(password) = password {
                    options = options.password(password);
                }
                Ok(Self::Postgres(options.connect().await?))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
                Ok(Self::SQLite(options.connect().await?))
            }
        }
    }
}

/// Backend-specific compiled statement.
#[derive(Debug)]
enum StatementKind {
    MySql(MySqlStatement<'static>),
    Postgres(PgStatement<'static>),
    SQLite(SqliteStatement<'static>),
}

/// A statement compiled on one [`DbConnection`].
#[derive(Debug)]
pub struct DbStatement {
    sql: String,
    key_column: Option<String>,
    kind: StatementKind,
}

impl DbStatement {
    fn returns_key(&self) -> bool {
        self.key_column.is_some()
    }
}

impl PreparedStatement for DbStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn key_column(&self) -> Option<&str> {
        self.key_column.as_deref()
    }

    /// The server-side handle belongs to the connection's own statement cache
    /// and is deallocated with it; dropping ours is all that is left to do.
    fn close(self) -> Result<(), sqlx::Error> {
        trace!(sql = %self.sql, "Releasing compiled statement");
        Ok(())
    }
}

/// Append a RETURNING clause for `column` unless the statement already has one.
fn with_returning(sql: &str, column: &str) -> String {
    let already = sql::inspect(sql).map(|s| s.has_returning).unwrap_or(false);
    if already {
        sql.to_string()
    } else {
        format!("{} RETURNING {}", sql.trim_end().trim_end_matches(';'), column)
    }
}

/// Postgres keys are usually `serial` (INT4) or `bigserial` (INT8).
fn postgres_key(row: &PgRow) -> Result<i64, sqlx::Error> {
    match row.try_get::<i64, _>(0) {
        Ok(key) => Ok(key),
        Err(wide) => row
            .try_get::<i32, _>(0)
            .map(i64::from)
            .or_else(|_| row.try_get::<i16, _>(0).map(i64::from))
            .map_err(|_| wide),
    }
}

impl Connection for DbConnection {
    type Statement = DbStatement;

    fn database_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySQL,
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn prepare(
        &mut self,
        sql: &str,
        config: &StatementConfig,
    ) -> Result<DbStatement, sqlx::Error> {
        let key_column = config.generated_key.clone();
        let kind = match self {
            Self::MySql(c) => {
                let stmt = sqlx::Executor::prepare(&mut *c, sql).await?;
                StatementKind::MySql(sqlx::Statement::to_owned(&stmt))
            }
            Self::Postgres(c) => {
                let text = match &config.generated_key {
                    Some(column) => with_returning(sql, column),
                    None => sql.to_string(),
                };
                let stmt = sqlx::Executor::prepare(&mut *c, text.as_str()).await?;
                StatementKind::Postgres(sqlx::Statement::to_owned(&stmt))
            }
            Self::SQLite(c) => {
                let stmt = sqlx::Executor::prepare(&mut *c, sql).await?;
                StatementKind::SQLite(sqlx::Statement::to_owned(&stmt))
            }
        };
        debug!(sql = %sql, key_column = ?key_column, "Prepared statement");
        Ok(DbStatement {
            sql: sql.to_string(),
            key_column,
            kind,
        })
    }

    async fn execute(
        &mut self,
        statement: &DbStatement,
        params: &[BoundParam],
    ) -> Result<ExecOutcome, sqlx::Error> {
        match (self, &statement.kind) {
            (Self::MySql(c), StatementKind::MySql(stmt)) => {
                let mut query = sqlx::Statement::query(stmt);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let result = query.execute(&mut *c).await?;
                let key = match result.last_insert_id() {
                    0 => None,
                    id => i64::try_from(id).ok(),
                };
                Ok(ExecOutcome {
                    rows_affected: result.rows_affected(),
                    generated_key: Ok(key.filter(|_| statement.returns_key())),
                })
            }
            (Self::Postgres(c), StatementKind::Postgres(stmt)) => {
                let mut query = sqlx::Statement::query(stmt);
                for param in params {
                    query = bind_postgres(query, param);
                }
                if statement.returns_key() {
                    let rows = query.fetch_all(&mut *c).await?;
                    Ok(ExecOutcome {
                        rows_affected: rows.len() as u64,
                        generated_key: rows.first().map(postgres_key).transpose(),
                    })
                } else {
                    let result = query.execute(&mut *c).await?;
                    Ok(ExecOutcome::without_key(result.rows_affected()))
                }
            }
            (Self::SQLite(c), StatementKind::SQLite(stmt)) => {
                let mut query = sqlx::Statement::query(stmt);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let result = query.execute(&mut *c).await?;
                let key = (statement.returns_key() && result.rows_affected() > 0)
                    .then(|| result.last_insert_rowid());
                Ok(ExecOutcome {
                    rows_affected: result.rows_affected(),
                    generated_key: Ok(key),
                })
            }
            (conn, _) => Err(sqlx::Error::Protocol(format!(
                "statement was not prepared on a {} connection",
                conn.database_type()
            ))),
        }
    }

    async fn execute_unprepared(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let rows = impl_db_dispatch!(self, {
            MySql(c) => sqlx::Executor::execute(&mut *c, sql).await?.rows_affected(),
            Postgres(c) => sqlx::Executor::execute(&mut *c, sql).await?.rows_affected(),
            SQLite(c) => sqlx::Executor::execute(&mut *c, sql).await?.rows_affected(),
        });
        Ok(rows)
    }

    fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        params: &'c [SqlParam],
        config: &StatementConfig,
    ) -> RowCursor<'c> {
        trace!(
            forward_only = config.forward_only,
            read_only = config.read_only,
            fetch_size = ?config.fetch_size,
            "Opening cursor"
        );
        impl_db_dispatch!(self, {
            MySql(c) => {
                let mut query = sqlx::query(sql).persistent(false);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                query.fetch(c).map(|row| row.map(|r| r.decode_row())).boxed()
            },
            Postgres(c) => {
                let mut query = sqlx::query(sql).persistent(false);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                query.fetch(c).map(|row| row.map(|r| r.decode_row())).boxed()
            },
            SQLite(c) => {
                let mut query = sqlx::query(sql).persistent(false);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                query.fetch(c).map(|row| row.map(|r| r.decode_row())).boxed()
            },
        })
    }

    fn create_large_object(&mut self, bytes: &[u8]) -> Result<BoundParam, LargeObjectError> {
        match self {
            // BLOB / LONGBLOB columns take the payload directly.
            Self::MySql(_) | Self::SQLite(_) => Ok(BoundParam::LargeObject(bytes.to_vec())),
            // Server-side large objects need the lo_* API and an OID column.
            Self::Postgres(_) => Err(LargeObjectError::Unsupported),
        }
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.execute_unprepared("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.execute_unprepared("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.execute_unprepared("ROLLBACK").await.map(|_| ())
    }

    async fn clear_statements(&mut self) -> Result<(), sqlx::Error> {
        impl_db_dispatch!(self, {
            MySql(c) => c.clear_cached_statements().await,
            Postgres(c) => c.clear_cached_statements().await,
            SQLite(c) => c.clear_cached_statements().await,
        })
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        impl_db_dispatch!(self, {
            MySql(c) => SqlxConnection::close(c).await,
            Postgres(c) => SqlxConnection::close(c).await,
            SQLite(c) => SqlxConnection::close(c).await,
        })
    }
}

/// Opens a fresh connection for every acquire.
#[derive(Clone)]
pub struct DriverConfig {
    pub db_type: DatabaseType,
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl DriverConfig {
    pub fn new(db_type: DatabaseType, url: impl Into<String>) -> Self {
        Self {
            db_type,
            url: url.into(),
            user: None,
            password: None,
        }
    }

    /// Infer the backend from the URL scheme.
    pub fn from_url(url: impl Into<String>) -> DbResult<Self> {
        let url = url.into();
        let db_type = DatabaseType::from_connection_string(&url).ok_or_else(|| {
            DbError::initialization(
                mask_url(&url),
                "Unrecognized connection URL scheme, expected postgres://, mysql:// or sqlite:",
            )
        })?;
        Ok(Self::new(db_type, url))
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("db_type", &self.db_type)
            .field("url", &mask_url(&self.url))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl ConnectionSource for DriverConfig {
    type Connection = DbConnection;

    async fn acquire(&self) -> Result<DbConnection, sqlx::Error> {
        DbConnection::connect(
            self.db_type,
            &self.url,
            self.user.as_deref(),
            self.password.as_deref(),
        )
        .await
    }

    fn describe(&self) -> String {
        mask_url(&self.url)
    }
}

/// Database-specific connection pool (avoids AnyPool limitations).
///
/// Connections taken from the pool are detached from it, so closing them
/// through the facade really closes them.
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub async fn connect(
        db_type: DatabaseType,
        url: &str,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        match db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(url)?.charset("utf8mb4");
                let pool = MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await?;
                Ok(Self::MySql(pool))
            }
            DatabaseType::PostgreSQL => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await?;
                Ok(Self::Postgres(pool))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await?;
                Ok(Self::SQLite(pool))
            }
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

impl ConnectionSource for DbPool {
    type Connection = DbConnection;

    async fn acquire(&self) -> Result<DbConnection, sqlx::Error> {
        Ok(match self {
            DbPool::MySql(pool) => DbConnection::MySql(pool.acquire().await?.detach()),
            DbPool::Postgres(pool) => DbConnection::Postgres(pool.acquire().await?.detach()),
            DbPool::SQLite(pool) => DbConnection::SQLite(pool.acquire().await?.detach()),
        })
    }

    fn describe(&self) -> String {
        format!("{} pool", self.db_type())
    }
}
