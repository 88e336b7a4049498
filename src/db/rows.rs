//! Streaming query results.

use crate::db::connection::{ConnectionId, RowCursor};
use crate::error::{DbError, DbResult};
use crate::models::{Row, SqlParam};
use futures_util::stream::{FusedStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error};

/// Lazy, forward-only sequence of rows backed by an open cursor.
///
/// The stream borrows the execution context for its whole life, so nothing
/// else can run on that context until it ends. The cursor is released exactly
/// once: when the stream is exhausted, when it yields an error, on
/// [`abort`](Self::abort), or when it is dropped.
pub struct RowStream<'a> {
    cursor: Option<RowCursor<'a>>,
    sql: &'a str,
    params: &'a [SqlParam],
    connection: ConnectionId,
    rows_read: usize,
    log_exceptions: bool,
}

impl<'a> RowStream<'a> {
    pub(crate) fn new(
        cursor: RowCursor<'a>,
        sql: &'a str,
        params: &'a [SqlParam],
        connection: ConnectionId,
        log_exceptions: bool,
    ) -> Self {
        Self {
            cursor: Some(cursor),
            sql,
            params,
            connection,
            rows_read: 0,
            log_exceptions,
        }
    }

    pub fn sql(&self) -> &str {
        self.sql
    }

    /// Rows yielded so far.
    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    pub fn is_released(&self) -> bool {
        self.cursor.is_none()
    }

    /// Stop iterating and release the cursor. Idempotent.
    pub fn abort(&mut self) {
        self.release("aborted");
    }

    /// Drain the remaining rows into memory.
    pub async fn collect_all(mut self) -> DbResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    fn release(&mut self, reason: &'static str) {
        if self.cursor.take().is_some() {
            debug!(
                connection_id = %self.connection,
                sql = %self.sql,
                rows = self.rows_read,
                reason = reason,
                "Released result cursor"
            );
        }
    }
}

impl Stream for RowStream<'_> {
    type Item = DbResult<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(cursor) = this.cursor.as_mut() else {
            return Poll::Ready(None);
        };
        match cursor.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(row))) => {
                this.rows_read += 1;
                Poll::Ready(Some(Ok(row)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.release("error");
                let err = DbError::query_failed(e, this.sql, this.params);
                if this.log_exceptions {
                    error!(connection_id = %this.connection, error = %err, "Query failed while streaming rows");
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.release("exhausted");
                Poll::Ready(None)
            }
        }
    }
}

impl FusedStream for RowStream<'_> {
    fn is_terminated(&self) -> bool {
        self.cursor.is_none()
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        self.release("dropped");
    }
}

impl std::fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("sql", &self.sql)
            .field("connection", &self.connection)
            .field("rows_read", &self.rows_read)
            .field("released", &self.is_released())
            .finish()
    }
}
