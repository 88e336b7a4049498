//! Caller-owned batched statements.

use crate::db::connection::{ConnectionId, PreparedStatement};
use crate::models::SqlParam;
use std::mem;
use tracing::warn;

/// A compiled statement plus the parameter sets queued for it.
///
/// Batches are never cached; the caller owns the statement and should
/// [`close`](Self::close) it when done.
#[derive(Debug)]
pub struct Batch<S> {
    statement: S,
    connection: ConnectionId,
    placeholders: usize,
    queued: Vec<Vec<SqlParam>>,
}

impl<S: PreparedStatement> Batch<S> {
    pub(crate) fn new(statement: S, connection: ConnectionId, placeholders: usize) -> Self {
        Self {
            statement,
            connection,
            placeholders,
            queued: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        self.statement.sql()
    }

    /// Connection the statement was compiled on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn placeholders(&self) -> usize {
        self.placeholders
    }

    /// Number of queued execution units.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub(crate) fn statement(&self) -> &S {
        &self.statement
    }

    pub(crate) fn push(&mut self, params: Vec<SqlParam>) {
        self.queued.push(params);
    }

    /// Empty the queue, handing back what was in it.
    pub(crate) fn take_queued(&mut self) -> Vec<Vec<SqlParam>> {
        mem::take(&mut self.queued)
    }

    /// Release the statement. Failures are logged, never raised.
    pub fn close(self) {
        let sql = self.statement.sql().to_string();
        if !self.queued.is_empty() {
            warn!(sql = %sql, pending = self.queued.len(), "Closing batch with unexecuted units");
        }
        if let Err(e) = self.statement.close() {
            warn!(sql = %sql, error = %e, "Failed to close batch statement");
        }
    }
}
