//! Per-execution-context connection registry.
//!
//! Every worker owns one [`ExecutionContext`] and passes it by `&mut` to the
//! facade. The context holds the worker's named connections, so two workers
//! never observe each other's bindings and all traffic through one binding is
//! serialized by the borrow checker rather than by locks.

use crate::db::connection::ConnectionId;
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Logical name used when none is given.
pub const DEFAULT_CONNECTION_NAME: &str = "default";

/// Runs once when a binding goes away, whichever path removes it.
pub type ReleaseHook = Box<dyn FnOnce(ConnectionId) + Send + Sync>;

/// A live connection bound to a logical name.
pub struct BoundConnection<C> {
    name: String,
    id: ConnectionId,
    attached_at: DateTime<Utc>,
    connection: C,
    on_release: Option<ReleaseHook>,
}

impl<C> BoundConnection<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Split into the identity and a mutable borrow of the connection.
    pub fn parts_mut(&mut self) -> (ConnectionId, &mut C) {
        (self.id, &mut self.connection)
    }

    pub fn into_connection(self) -> C {
        self.connection
    }

    fn release(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(self.id);
        }
    }
}

impl<C> std::fmt::Debug for BoundConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundConnection")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("attached_at", &self.attached_at)
            .finish()
    }
}

/// Mapping from logical name to live connection for one context.
pub struct ConnectionRegistry<C> {
    bindings: HashMap<String, BoundConnection<C>>,
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BoundConnection<C>> {
        self.bindings.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BoundConnection<C>> {
        self.bindings.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Bind `connection` under `name`.
    ///
    /// Fails with `DuplicateBinding` if the name is already bound: the caller
    /// forgot to close or detach the previous connection.
    pub fn attach(&mut self, name: &str, connection: C) -> DbResult<ConnectionId> {
        self.bind(name, connection, None)
    }

    /// Like [`attach`](Self::attach), running `on_release` when the binding is
    /// later removed by `detach` or by dropping the owning context.
    pub fn attach_with(
        &mut self,
        name: &str,
        connection: C,
        on_release: impl FnOnce(ConnectionId) + Send + Sync + 'static,
    ) -> DbResult<ConnectionId> {
        self.bind(name, connection, Some(Box::new(on_release)))
    }

    fn bind(
        &mut self,
        name: &str,
        connection: C,
        on_release: Option<ReleaseHook>,
    ) -> DbResult<ConnectionId> {
        if let Some(existing) = self.bindings.get(name) {
            warn!(
                name = %name,
                connection_id = %existing.id,
                "Opening a connection without closing the previous one"
            );
            return Err(DbError::duplicate_binding(name));
        }

        let id = ConnectionId::new();
        self.bindings.insert(
            name.to_string(),
            BoundConnection {
                name: name.to_string(),
                id,
                attached_at: Utc::now(),
                connection,
                on_release,
            },
        );
        debug!(name = %name, connection_id = %id, "Attached connection");
        Ok(id)
    }

    /// Remove the binding for `name`, leaving the connection itself untouched.
    pub fn detach(&mut self, name: &str) -> Option<BoundConnection<C>> {
        let mut bound = self.bindings.remove(name)?;
        bound.release();
        debug!(name = %name, connection_id = %bound.id, "Detached connection");
        Some(bound)
    }

    /// All bindings, for diagnostics and shutdown sweeps.
    pub fn list_all(&self) -> Vec<&BoundConnection<C>> {
        self.bindings.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn drain(&mut self) -> Vec<BoundConnection<C>> {
        self.bindings.drain().map(|(_, bound)| bound).collect()
    }
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by one worker: its label and its connection registry.
///
/// Dropping a context that still has bindings is a leak in the caller's
/// connection handling; it is logged, release hooks run and the connections
/// are dropped.
pub struct ExecutionContext<C> {
    label: String,
    registry: ConnectionRegistry<C>,
}

impl<C> ExecutionContext<C> {
    pub fn new() -> Self {
        Self::with_label(format!("ctx_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut ConnectionRegistry<C> {
        &mut self.registry
    }
}

impl<C> Default for ExecutionContext<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Drop for ExecutionContext<C> {
    fn drop(&mut self) {
        for mut bound in self.registry.drain() {
            bound.release();
            warn!(
                context = %self.label,
                name = %bound.name,
                connection_id = %bound.id,
                "Connection still bound when execution context ended. MUST INVESTIGATE POTENTIAL CONNECTION LEAK!"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_registry_creation() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("default").is_none());
    }

    #[test]
    fn test_attach_then_get() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.attach("default", 7u32).unwrap();
        let bound = registry.get("default").unwrap();
        assert_eq!(bound.id(), id);
        assert_eq!(*bound.connection(), 7);
        assert_eq!(bound.name(), "default");
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let mut registry = ConnectionRegistry::new();
        registry.attach("default", 1u32).unwrap();
        let err = registry.attach("default", 2u32).unwrap_err();
        assert!(matches!(err, DbError::DuplicateBinding { ref name } if name == "default"));
        // the first binding survives
        assert_eq!(*registry.get("default").unwrap().connection(), 1);
    }

    #[test]
    fn test_detach_removes_binding_and_returns_connection() {
        let mut registry = ConnectionRegistry::new();
        registry.attach("a", 1u32).unwrap();
        let bound = registry.detach("a").unwrap();
        assert_eq!(bound.into_connection(), 1);
        assert!(!registry.contains("a"));
        assert!(registry.detach("a").is_none());
        // the name can be bound again
        registry.attach("a", 2u32).unwrap();
    }

    #[test]
    fn test_release_hook_runs_once_on_detach() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let mut registry = ConnectionRegistry::new();
        let id = registry
            .attach_with("a", 1u32, move |id| sink.lock().unwrap().push(id))
            .unwrap();

        let bound = registry.detach("a").unwrap();
        assert_eq!(*released.lock().unwrap(), vec![id]);
        assert_eq!(bound.into_connection(), 1);
        assert!(registry.detach("a").is_none());
        assert_eq!(released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_release_hook_runs_when_context_dropped() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let mut ctx: ExecutionContext<u32> = ExecutionContext::with_label("worker");
        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let sink = Arc::clone(&released);
            let id = ctx
                .registry_mut()
                .attach_with(name, 1, move |id| sink.lock().unwrap().push(id))
                .unwrap();
            ids.push(id);
        }
        drop(ctx);

        let mut released = released.lock().unwrap().clone();
        released.sort_by_key(|id| id.to_string());
        ids.sort_by_key(|id| id.to_string());
        assert_eq!(released, ids);
    }

    #[test]
    fn test_list_all_and_names() {
        let mut registry = ConnectionRegistry::new();
        registry.attach("b", 2u32).unwrap();
        registry.attach("a", 1u32).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_all().len(), 2);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_contexts_are_isolated() {
        let mut first: ExecutionContext<u32> = ExecutionContext::with_label("first");
        let mut second: ExecutionContext<u32> = ExecutionContext::with_label("second");
        first.registry_mut().attach("default", 1).unwrap();
        second.registry_mut().attach("default", 2).unwrap();
        assert_eq!(*first.registry().get("default").unwrap().connection(), 1);
        assert_eq!(*second.registry().get("default").unwrap().connection(), 2);
        first.registry_mut().detach("default");
        second.registry_mut().detach("default");
    }

    #[test]
    fn test_context_drop_with_bindings_does_not_panic() {
        let mut ctx: ExecutionContext<u32> = ExecutionContext::new();
        assert!(ctx.label().starts_with("ctx_"));
        ctx.registry_mut().attach("leaked", 1).unwrap();
        drop(ctx);
    }
}
