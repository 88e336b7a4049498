//! Cross-context cache of compiled statements.
//!
//! The outer map (connection identity to per-connection map) is shared by every
//! execution context and guarded by a `RwLock`. Each per-connection map sits
//! behind its own `Mutex`; only the context that owns the connection ever takes
//! it, so that lock is uncontended. No lock is held across an `.await`.

use crate::db::connection::{ConnectionId, PreparedStatement};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

type StatementMap<S> = HashMap<String, Arc<S>>;

pub struct StatementCache<S> {
    statements: RwLock<HashMap<ConnectionId, Arc<Mutex<StatementMap<S>>>>>,
}

impl<S: PreparedStatement> StatementCache<S> {
    pub fn new() -> Self {
        Self {
            statements: RwLock::new(HashMap::new()),
        }
    }

    /// Cached statement for `sql` on the given connection.
    pub fn lookup(&self, connection: ConnectionId, sql: &str) -> Option<Arc<S>> {
        let inner = self.inner(connection)?;
        let map = lock(&inner);
        map.get(sql).cloned()
    }

    /// Cache `statement` for `sql` on the given connection and return the shared handle.
    ///
    /// A statement already cached under the same SQL is replaced and released.
    pub fn store(&self, connection: ConnectionId, sql: &str, statement: S) -> Arc<S> {
        let inner = self.inner_or_insert(connection);
        let statement = Arc::new(statement);
        let replaced = lock(&inner).insert(sql.to_string(), Arc::clone(&statement));
        if let Some(old) = replaced {
            debug!(connection_id = %connection, sql = %sql, "Replacing cached statement");
            release(connection, old);
        }
        statement
    }

    /// Drop every statement cached for the connection, closing each one.
    ///
    /// Close failures are logged and swallowed. Returns the number of entries removed.
    pub fn evict(&self, connection: ConnectionId) -> usize {
        let removed = {
            let mut outer = self
                .statements
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            outer.remove(&connection)
        };
        let Some(inner) = removed else {
            return 0;
        };

        let statements: Vec<Arc<S>> = lock(&inner).drain().map(|(_, s)| s).collect();
        let count = statements.len();
        for statement in statements {
            release(connection, statement);
        }
        if count > 0 {
            debug!(connection_id = %connection, count = count, "Evicted cached statements");
        }
        count
    }

    /// Number of statements cached for the connection.
    pub fn cached_statements(&self, connection: ConnectionId) -> usize {
        self.inner(connection).map(|inner| lock(&inner).len()).unwrap_or(0)
    }

    /// Number of connections with a cache entry.
    pub fn connection_count(&self) -> usize {
        self.statements
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn inner(&self, connection: ConnectionId) -> Option<Arc<Mutex<StatementMap<S>>>> {
        self.statements
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&connection)
            .cloned()
    }

    fn inner_or_insert(&self, connection: ConnectionId) -> Arc<Mutex<StatementMap<S>>> {
        if let Some(inner) = self.inner(connection) {
            return inner;
        }
        let mut outer = self
            .statements
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(outer.entry(connection).or_default())
    }
}

impl<S: PreparedStatement> Default for StatementCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<S>(inner: &Mutex<StatementMap<S>>) -> MutexGuard<'_, StatementMap<S>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Close a statement if this was the last handle; otherwise it is released when
/// the remaining holder drops it.
fn release<S: PreparedStatement>(connection: ConnectionId, statement: Arc<S>) {
    match Arc::try_unwrap(statement) {
        Ok(statement) => {
            let sql = statement.sql().to_string();
            if let Err(e) = statement.close() {
                warn!(
                    connection_id = %connection,
                    sql = %sql,
                    error = %e,
                    "Failed to close cached statement"
                );
            }
        }
        Err(shared) => {
            debug!(
                connection_id = %connection,
                sql = %shared.sql(),
                "Cached statement still in use; released on last drop"
            );
        }
    }
}
