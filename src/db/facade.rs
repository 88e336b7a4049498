//! Access facade: named connections, validated execution, transactions and
//! batches.
//!
//! A [`Db`] is a cheap handle naming one logical connection. Every operation
//! takes the caller's [`ExecutionContext`], resolves the named binding there and
//! drives the bound connection. The statement cache is shared by all handles
//! cloned from (or [`named`](Db::named) after) the same root, across contexts.

use crate::config::Settings;
use crate::db::batch::Batch;
use crate::db::connection::{
    BoundParam, Connection, ConnectionId, ConnectionSource, FetchStrategy, PreparedStatement,
    StatementConfig,
};
use crate::db::driver::{DbConnection, DriverConfig};
use crate::db::registry::{DEFAULT_CONNECTION_NAME, ExecutionContext};
use crate::db::rows::RowStream;
use crate::db::sql;
use crate::db::statement_cache::StatementCache;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row, SqlParam};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Returned by [`Db::exec_insert`] when no key was generated or it could not be read.
pub const NO_GENERATED_KEY: i64 = -1;

pub struct Db<C: Connection> {
    name: String,
    cache: Arc<StatementCache<C::Statement>>,
    settings: Settings,
}

impl<C: Connection> Clone for Db<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cache: Arc::clone(&self.cache),
            settings: self.settings,
        }
    }
}

impl<C: Connection> std::fmt::Debug for Db<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("cached_connections", &self.cache.connection_count())
            .finish()
    }
}

impl<C: Connection> Default for Db<C> {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl<C: Connection> Db<C> {
    /// Facade for the default connection name with a fresh statement cache.
    pub fn new(settings: Settings) -> Self {
        Self::with_cache(Arc::new(StatementCache::new()), settings)
    }

    pub fn with_cache(cache: Arc<StatementCache<C::Statement>>, settings: Settings) -> Self {
        Self {
            name: DEFAULT_CONNECTION_NAME.to_string(),
            cache,
            settings,
        }
    }

    /// Facade for another logical connection, sharing this one's cache and settings.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: Arc::clone(&self.cache),
            settings: self.settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn cache(&self) -> &Arc<StatementCache<C::Statement>> {
        &self.cache
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Acquire a connection from `source` and bind it under this facade's name.
    pub async fn open_with<S>(
        &self,
        ctx: &mut ExecutionContext<C>,
        source: &S,
    ) -> DbResult<ConnectionId>
    where
        S: ConnectionSource<Connection = C>,
    {
        // Fail before opening a physical connection that would only be thrown away.
        if let Some(existing) = ctx.registry().get(&self.name) {
            warn!(
                name = %self.name,
                connection_id = %existing.id(),
                "Opening a connection without closing the previous one"
            );
            return Err(DbError::duplicate_binding(&self.name));
        }

        let target = source.describe();
        let connection = source.acquire().await.map_err(|e| {
            if self.settings.log_exceptions {
                error!(name = %self.name, target = %target, error = %e, "Failed to open connection");
            }
            DbError::initialization(&target, e.to_string())
        })?;
        let db_type = connection.database_type();
        let id = self.bind(ctx, connection)?;
        info!(
            name = %self.name,
            connection_id = %id,
            db_type = %db_type,
            target = %target,
            context = %ctx.label(),
            "Opened connection"
        );
        Ok(id)
    }

    /// Bind a connection obtained elsewhere.
    pub fn attach(&self, ctx: &mut ExecutionContext<C>, connection: C) -> DbResult<ConnectionId> {
        self.bind(ctx, connection)
    }

    /// Unbind the connection without closing it and hand it back.
    ///
    /// Cached statements for the connection are released first, both ours and
    /// any the connection kept itself, so it can go back to a pool clean.
    /// Returns `None` (after logging a warning) when nothing is bound.
    pub async fn detach(&self, ctx: &mut ExecutionContext<C>) -> Option<C> {
        match ctx.registry_mut().detach(&self.name) {
            Some(bound) => {
                let id = bound.id();
                let mut connection = bound.into_connection();
                if let Err(e) = connection.clear_statements().await {
                    warn!(
                        name = %self.name,
                        connection_id = %id,
                        error = %e,
                        "Could not clear statements cached on the connection"
                    );
                }
                Some(connection)
            }
            None => {
                warn!(
                    name = %self.name,
                    context = %ctx.label(),
                    "Cannot detach connection: nothing is bound under this name"
                );
                None
            }
        }
    }

    /// Close the bound connection. See [`close_with`](Self::close_with).
    pub async fn close(&self, ctx: &mut ExecutionContext<C>) {
        self.close_with(ctx, false).await
    }

    /// Release cached statements, close the connection and unbind it.
    ///
    /// Never fails: the binding is removed before anything else happens, and
    /// failures along the way are logged unless `suppress_warning` is set.
    pub async fn close_with(&self, ctx: &mut ExecutionContext<C>, suppress_warning: bool) {
        let Some(bound) = ctx.registry_mut().detach(&self.name) else {
            if !suppress_warning {
                warn!(
                    name = %self.name,
                    context = %ctx.label(),
                    "Cannot close connection: nothing is bound under this name"
                );
            }
            return;
        };

        let id = bound.id();
        match bound.into_connection().close().await {
            Ok(()) => info!(name = %self.name, connection_id = %id, "Closed connection"),
            Err(e) if !suppress_warning => warn!(
                name = %self.name,
                connection_id = %id,
                error = %e,
                "Could not close connection cleanly"
            ),
            Err(_) => {}
        }
    }

    pub fn has_connection(&self, ctx: &ExecutionContext<C>) -> bool {
        ctx.registry().contains(&self.name)
    }

    /// The connection bound under this facade's name.
    pub fn connection<'c>(&self, ctx: &'c ExecutionContext<C>) -> DbResult<&'c C> {
        ctx.registry()
            .get(&self.name)
            .map(|bound| bound.connection())
            .ok_or_else(|| DbError::not_bound(&self.name, "access connection"))
    }

    /// Names of every connection bound in the context.
    pub fn connections(&self, ctx: &ExecutionContext<C>) -> Vec<String> {
        ctx.registry().names()
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// `SELECT COUNT(*)` over a whole table.
    pub async fn count(&self, ctx: &mut ExecutionContext<C>, table: &str) -> DbResult<u64> {
        self.count_where(ctx, table, "*", &[]).await
    }

    /// `SELECT COUNT(*) FROM table WHERE filter`. A filter of `*` means no filter
    /// and cannot be combined with parameters.
    pub async fn count_where(
        &self,
        ctx: &mut ExecutionContext<C>,
        table: &str,
        filter: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        let table = table.trim();
        if table.is_empty() {
            return Err(DbError::invalid_input("table name must not be empty"));
        }
        let filter = filter.trim();
        let sql = if filter == "*" {
            if !params.is_empty() {
                return Err(DbError::invalid_input(
                    "filter '*' cannot be combined with parameters",
                ));
            }
            format!("SELECT COUNT(*) FROM {table}")
        } else {
            format!("SELECT COUNT(*) FROM {table} WHERE {filter}")
        };

        let value = self.first_cell(ctx, &sql, params).await?;
        value
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| DbError::access(format!("COUNT(*) returned no usable value: {sql}")))
    }

    /// Start a streaming query.
    ///
    /// The statement is validated here; the backend is not contacted until the
    /// stream is first polled. MySQL connections get a forward-only, read-only
    /// cursor that delivers rows one at a time.
    pub fn find<'a>(
        &self,
        ctx: &'a mut ExecutionContext<C>,
        sql: &'a str,
        params: &'a [SqlParam],
    ) -> DbResult<RowStream<'a>> {
        sql::ensure_query(sql, params.len())?;
        let (id, conn) = self.bound(ctx, "run query")?;
        let strategy = FetchStrategy::resolve(conn.database_type());
        debug!(
            name = %self.name,
            sql = %sql,
            params = params.len(),
            strategy = ?strategy,
            "Opening row stream"
        );
        let cursor = conn.fetch(sql, params, &strategy.statement_config());
        Ok(RowStream::new(
            cursor,
            sql,
            params,
            id,
            self.settings.log_exceptions,
        ))
    }

    /// Run a query and collect every row.
    pub async fn find_all(
        &self,
        ctx: &mut ExecutionContext<C>,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<Vec<Row>> {
        let start = Instant::now();
        let rows = self.find(ctx, sql, params)?.collect_all().await?;
        debug!(
            sql = %sql,
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query completed"
        );
        Ok(rows)
    }

    /// First column of the first row, or `None` for an empty result.
    pub async fn first_cell(
        &self,
        ctx: &mut ExecutionContext<C>,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<Option<JsonValue>> {
        let mut rows = self.find(ctx, sql, params)?;
        let first = rows.next().await.transpose()?;
        rows.abort();
        first.map(single_value).transpose()
    }

    /// The single selected column of every row.
    pub async fn first_column(
        &self,
        ctx: &mut ExecutionContext<C>,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<Vec<JsonValue>> {
        let mut rows = self.find(ctx, sql, params)?;
        let mut values = Vec::new();
        while let Some(row) = rows.next().await {
            values.push(single_value(row?)?);
        }
        Ok(values)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Run an unparametrized DML/DDL statement; returns the affected rows.
    pub async fn exec(&self, ctx: &mut ExecutionContext<C>, sql: &str) -> DbResult<u64> {
        sql::ensure_dml(sql, false)?;
        let (_, conn) = self.bound(ctx, "execute statement")?;

        let start = Instant::now();
        let rows = conn
            .execute_unprepared(sql)
            .await
            .map_err(|e| self.failure(e, sql, &[]))?;
        debug!(
            sql = %sql,
            rows_affected = rows,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Statement executed"
        );
        Ok(rows)
    }

    /// Run a parametrized DML statement; returns the affected rows.
    pub async fn exec_with(
        &self,
        ctx: &mut ExecutionContext<C>,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        sql::ensure_dml(sql, true)?;
        let (_, conn) = self.bound(ctx, "execute statement")?;

        let start = Instant::now();
        let statement = conn
            .prepare(sql, &StatementConfig::default())
            .await
            .map_err(|e| self.failure(e, sql, params))?;
        let bound: Vec<BoundParam> = params.iter().map(BoundParam::from).collect();
        let outcome = conn.execute(&statement, &bound).await;
        close_statement(statement);
        let outcome = outcome.map_err(|e| self.failure(e, sql, params))?;

        debug!(
            sql = %sql,
            params = params.len(),
            rows_affected = outcome.rows_affected,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Statement executed"
        );
        Ok(outcome.rows_affected)
    }

    /// Run an INSERT and return the value generated for `key_column`.
    ///
    /// The compiled statement is cached per connection. Binary parameters are
    /// bound as large objects where the driver supports it. Returns
    /// [`NO_GENERATED_KEY`] when no key was produced or reading it failed.
    pub async fn exec_insert(
        &self,
        ctx: &mut ExecutionContext<C>,
        sql: &str,
        key_column: &str,
        params: &[SqlParam],
    ) -> DbResult<i64> {
        sql::ensure_insert(sql)?;
        let (id, conn) = self.bound(ctx, "execute insert")?;

        let start = Instant::now();
        // A statement compiled to return another key column cannot be reused.
        let cached = self
            .cache
            .lookup(id, sql)
            .filter(|statement| statement.key_column().is_none_or(|k| k == key_column));
        let statement = match cached {
            Some(statement) => statement,
            None => {
                let statement = conn
                    .prepare(sql, &StatementConfig::returning_key(key_column))
                    .await
                    .map_err(|e| self.failure(e, sql, params))?;
                self.cache.store(id, sql, statement)
            }
        };

        let bound: Vec<BoundParam> = params.iter().map(|p| insert_param(conn, p)).collect();
        let outcome = conn
            .execute(&statement, &bound)
            .await
            .map_err(|e| self.failure(e, sql, params))?;

        let key = match outcome.generated_key {
            Ok(Some(key)) => key,
            Ok(None) => NO_GENERATED_KEY,
            Err(e) => {
                error!(
                    sql = %sql,
                    key_column = %key_column,
                    error = %e,
                    "Could not read generated key"
                );
                NO_GENERATED_KEY
            }
        };
        debug!(
            sql = %sql,
            params = params.len(),
            generated_key = key,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Insert executed"
        );
        Ok(key)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    pub async fn open_transaction(&self, ctx: &mut ExecutionContext<C>) -> DbResult<()> {
        let (id, conn) = self.bound(ctx, "open transaction")?;
        conn.begin()
            .await
            .map_err(|e| self.failure(e, "BEGIN", &[]))?;
        info!(name = %self.name, connection_id = %id, "Transaction started");
        Ok(())
    }

    pub async fn commit_transaction(&self, ctx: &mut ExecutionContext<C>) -> DbResult<()> {
        let (id, conn) = self.bound(ctx, "commit transaction")?;
        conn.commit()
            .await
            .map_err(|e| self.failure(e, "COMMIT", &[]))?;
        info!(name = %self.name, connection_id = %id, "Transaction committed");
        Ok(())
    }

    pub async fn rollback_transaction(&self, ctx: &mut ExecutionContext<C>) -> DbResult<()> {
        let (id, conn) = self.bound(ctx, "rollback transaction")?;
        conn.rollback()
            .await
            .map_err(|e| self.failure(e, "ROLLBACK", &[]))?;
        info!(name = %self.name, connection_id = %id, "Transaction rolled back");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Batches
    // ---------------------------------------------------------------------

    /// Compile `sql` for batched execution. The batch is not cached; close it
    /// when done.
    pub async fn start_batch(
        &self,
        ctx: &mut ExecutionContext<C>,
        sql: &str,
    ) -> DbResult<Batch<C::Statement>> {
        let shape = sql::ensure_dml(sql, false)?;
        let (id, conn) = self.bound(ctx, "start batch")?;
        let statement = conn
            .prepare(sql, &StatementConfig::default())
            .await
            .map_err(|e| self.failure(e, sql, &[]))?;
        debug!(sql = %sql, connection_id = %id, "Batch started");
        Ok(Batch::new(statement, id, shape.placeholders))
    }

    /// Queue one execution unit.
    pub fn add_batch(&self, batch: &mut Batch<C::Statement>, params: Vec<SqlParam>) -> DbResult<()> {
        if !params.is_empty() && batch.placeholders() == 0 {
            return Err(DbError::invalid_input(
                "parameters were passed, but the batch statement does not have placeholders: (?)",
            ));
        }
        batch.push(params);
        Ok(())
    }

    /// Execute every queued unit in order; returns one affected-row count per
    /// unit. The queue is empty afterwards, whether or not a unit failed.
    pub async fn execute_batch(
        &self,
        ctx: &mut ExecutionContext<C>,
        batch: &mut Batch<C::Statement>,
    ) -> DbResult<Vec<u64>> {
        let (id, conn) = self.bound(ctx, "execute batch")?;
        if batch.connection_id() != id {
            return Err(DbError::access(format!(
                "Batch was started on connection {} but '{}' is now bound to {}",
                batch.connection_id(),
                self.name,
                id
            )));
        }

        let start = Instant::now();
        let units = batch.take_queued();
        let mut counts = Vec::with_capacity(units.len());
        for params in &units {
            let bound: Vec<BoundParam> = params.iter().map(BoundParam::from).collect();
            let outcome = conn
                .execute(batch.statement(), &bound)
                .await
                .map_err(|e| self.failure(e, batch.sql(), params))?;
            counts.push(outcome.rows_affected);
        }
        debug!(
            sql = %batch.sql(),
            units = counts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch executed"
        );
        Ok(counts)
    }

    // ---------------------------------------------------------------------

    /// Bind under this facade's name; the binding evicts its cached statements
    /// however it is removed, including when the context is dropped.
    fn bind(&self, ctx: &mut ExecutionContext<C>, connection: C) -> DbResult<ConnectionId> {
        let cache = Arc::downgrade(&self.cache);
        ctx.registry_mut()
            .attach_with(&self.name, connection, move |id| {
                if let Some(cache) = cache.upgrade() {
                    cache.evict(id);
                }
            })
    }

    fn bound<'c>(
        &self,
        ctx: &'c mut ExecutionContext<C>,
        action: &str,
    ) -> DbResult<(ConnectionId, &'c mut C)> {
        ctx.registry_mut()
            .get_mut(&self.name)
            .map(|bound| bound.parts_mut())
            .ok_or_else(|| DbError::not_bound(&self.name, action))
    }

    fn failure(&self, err: sqlx::Error, sql: &str, params: &[SqlParam]) -> DbError {
        let err = DbError::query_failed(err, sql, params);
        if self.settings.log_exceptions {
            error!(name = %self.name, error = %err, "Statement failed");
        }
        err
    }
}

impl Db<DbConnection> {
    /// Open a sqlx connection for an explicit backend.
    pub async fn open(
        &self,
        ctx: &mut ExecutionContext<DbConnection>,
        db_type: DatabaseType,
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> DbResult<ConnectionId> {
        let source = DriverConfig::new(db_type, url)
            .with_credentials(user.map(str::to_string), password.map(str::to_string));
        self.open_with(ctx, &source).await
    }

    /// Open a sqlx connection, inferring the backend from the URL scheme.
    pub async fn open_url(
        &self,
        ctx: &mut ExecutionContext<DbConnection>,
        url: &str,
    ) -> DbResult<ConnectionId> {
        let source = DriverConfig::from_url(url)?;
        self.open_with(ctx, &source).await
    }
}

/// Wrap binary values as large objects, falling back to a plain value on any
/// large-object failure.
fn insert_param<C: Connection>(conn: &mut C, param: &SqlParam) -> BoundParam {
    let SqlParam::Bytes(bytes) = param else {
        return BoundParam::from(param);
    };
    match conn.create_large_object(bytes) {
        Ok(bound) => bound,
        Err(e) => {
            debug!(error = %e, len = bytes.len(), "Binding bytes as a plain value");
            BoundParam::from(param)
        }
    }
}

fn single_value(row: Row) -> DbResult<JsonValue> {
    if row.len() != 1 {
        return Err(DbError::invalid_input(format!(
            "query must select exactly one column, got {}",
            row.len()
        )));
    }
    Ok(row.into_iter().next().map(|(_, v)| v).unwrap_or(JsonValue::Null))
}

fn close_statement<S: PreparedStatement>(statement: S) {
    let sql = statement.sql().to_string();
    if let Err(e) = statement.close() {
        warn!(sql = %sql, error = %e, "Failed to close statement");
    }
}
