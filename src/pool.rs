//! Per-role pool of hidden connections.
//!
//! Each pool serves one role and keeps at most one live connection per
//! target. Concurrent `ensure()` callers share a single in-flight
//! establishment, and a `close()` that lands while that establishment is
//! still running makes it discard the connection instead of caching it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::context::HostContext;
use crate::error::MonitorError;
use crate::role::{Role, TargetId};
use crate::transport::{Connection, Transport};

type ConnectResult = Result<Arc<dyn Connection>, MonitorError>;
type PendingConnection = Shared<BoxFuture<'static, ConnectResult>>;

/// Invoked after a connection was evicted because the remote closed it.
pub type CloseObserver = Arc<dyn Fn(&TargetId) + Send + Sync>;

/// Pointer identity for trait objects, ignoring vtables.
pub(crate) fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Default)]
struct PoolRegistry {
    connections: HashMap<TargetId, Arc<dyn Connection>>,
    pending: HashMap<TargetId, PendingConnection>,
    cancelled: HashSet<TargetId>,
}

struct PoolInner {
    role: Role,
    transport: Arc<dyn Transport>,
    host: Arc<dyn HostContext>,
    enabled: bool,
    shut_down: AtomicBool,
    registry: Mutex<PoolRegistry>,
    close_observer: Mutex<Option<CloseObserver>>,
}

/// Pool of hidden connections for a single role
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("ConnectionPool")
            .field("role", &self.inner.role)
            .field("connections", &registry.connections.len())
            .field("pending", &registry.pending.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostContext>,
        enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                role,
                transport,
                host,
                enabled,
                shut_down: AtomicBool::new(false),
                registry: Mutex::new(PoolRegistry::default()),
                close_observer: Mutex::new(None),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn set_close_observer(&self, observer: CloseObserver) {
        *self.inner.close_observer.lock() = Some(observer);
    }

    /// Return the live connection for `target`, joining an establishment
    /// already in progress or starting a new one.
    pub async fn ensure(&self, target: &TargetId) -> Result<Arc<dyn Connection>, MonitorError> {
        let pending = {
            let mut registry = self.inner.registry.lock();
            if let Some(connection) = registry.connections.get(target) {
                return Ok(connection.clone());
            }
            match registry.pending.get(target) {
                Some(pending) => pending.clone(),
                None => {
                    self.inner.check_preconditions(target)?;
                    // A mark left by an earlier close has nothing to cancel anymore.
                    registry.cancelled.remove(target);
                    let pending = self.establish(*target);
                    registry.pending.insert(*target, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// The cached connection, without connecting.
    pub fn get(&self, target: &TargetId) -> Option<Arc<dyn Connection>> {
        self.inner.registry.lock().connections.get(target).cloned()
    }

    pub fn is_pending(&self, target: &TargetId) -> bool {
        self.inner.registry.lock().pending.contains_key(target)
    }

    /// Drop the connection for `target`. Idempotent and never fails; an
    /// establishment still in flight will discard its result.
    pub async fn close(&self, target: &TargetId) {
        let connection = {
            let mut registry = self.inner.registry.lock();
            if registry.pending.contains_key(target) {
                registry.cancelled.insert(*target);
            }
            registry.connections.remove(target)
        };

        if let Some(connection) = connection {
            self.shut(target, connection).await;
        }
    }

    /// Close `connection` only if it is still the one cached for `target`.
    pub async fn release(&self, target: &TargetId, connection: &Arc<dyn Connection>) {
        let released = {
            let mut registry = self.inner.registry.lock();
            match registry.connections.get(target) {
                Some(cached) if same_connection(cached, connection) => {
                    registry.connections.remove(target)
                }
                _ => None,
            }
        };

        if let Some(connection) = released {
            self.shut(target, connection).await;
        }
    }

    async fn shut(&self, target: &TargetId, connection: Arc<dyn Connection>) {
        match connection.close().await {
            Ok(()) => tracing::debug!(
                "Closed hidden {} connection to {}",
                self.inner.role,
                target
            ),
            Err(e) => tracing::warn!(
                "Failed to close hidden {} connection to {}: {}",
                self.inner.role,
                target,
                e
            ),
        }
    }

    /// Close `target` and wait for any pending establishment to settle, so
    /// that a discarded connection is already closed on return.
    pub async fn drain(&self, target: &TargetId) {
        self.close(target).await;
        let pending = self.inner.registry.lock().pending.get(target).cloned();
        if let Some(pending) = pending {
            let _ = pending.await;
        }
    }

    /// Reject every future establishment with a precondition error.
    pub fn shut_down(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }

    /// Every target with a cached, pending or cancelled entry.
    pub fn tracked_targets(&self) -> HashSet<TargetId> {
        let registry = self.inner.registry.lock();
        registry
            .connections
            .keys()
            .chain(registry.pending.keys())
            .chain(registry.cancelled.iter())
            .copied()
            .collect()
    }

    fn establish(&self, target: TargetId) -> PendingConnection {
        // Runs as its own task so it settles even if every waiter goes away.
        let task = tokio::spawn(self.inner.clone().connect(target));
        let inner = self.inner.clone();

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let mut registry = inner.registry.lock();
                    registry.pending.remove(&target);
                    registry.cancelled.remove(&target);
                    Err(MonitorError::Transport(format!(
                        "connection task for {} failed: {}",
                        target, e
                    )))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl PoolInner {
    fn check_preconditions(&self, target: &TargetId) -> Result<(), MonitorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MonitorError::Precondition(
                "hidden sessions are shutting down".to_string(),
            ));
        }
        if !self.enabled || !self.host.is_role_enabled(target, self.role) {
            return Err(MonitorError::Precondition(format!(
                "{} monitoring is disabled for {}",
                self.role, target
            )));
        }
        Ok(())
    }

    async fn connect(self: Arc<Self>, target: TargetId) -> ConnectResult {
        tracing::debug!("Opening hidden {} connection to {}", self.role, target);

        let connection = match self.transport.connect(&target).await {
            Ok(connection) => connection,
            Err(e) => {
                let mut registry = self.registry.lock();
                registry.pending.remove(&target);
                registry.cancelled.remove(&target);
                tracing::warn!(
                    "Hidden {} connection to {} failed: {}",
                    self.role,
                    target,
                    e
                );
                return Err(e);
            }
        };

        let pool = Arc::downgrade(&self);
        let watched = Arc::downgrade(&connection);
        connection.on_close(Box::new(move || {
            if let (Some(pool), Some(connection)) = (pool.upgrade(), watched.upgrade()) {
                pool.evict_closed(&target, &connection);
            }
        }));

        let discarded = {
            let mut registry = self.registry.lock();
            registry.pending.remove(&target);
            if registry.cancelled.remove(&target) {
                true
            } else {
                registry.connections.insert(target, connection.clone());
                false
            }
        };

        if discarded {
            tracing::info!(
                "Discarding hidden {} connection to {}: closed while connecting",
                self.role,
                target
            );
            if let Err(e) = connection.close().await {
                tracing::warn!("Failed to close discarded connection to {}: {}", target, e);
            }
            return Err(MonitorError::Discarded(target));
        }

        tracing::info!("Hidden {} connection to {} ready", self.role, target);
        Ok(connection)
    }

    fn evict_closed(&self, target: &TargetId, connection: &Arc<dyn Connection>) {
        let evicted = {
            let mut registry = self.registry.lock();
            match registry.connections.get(target) {
                Some(cached) if same_connection(cached, connection) => {
                    registry.connections.remove(target);
                    true
                }
                _ => false,
            }
        };

        if evicted {
            tracing::warn!(
                "Hidden {} connection to {} closed unexpectedly",
                self.role,
                target
            );
            let observer = self.close_observer.lock().clone();
            if let Some(observer) = observer {
                observer(target);
            }
        }
    }
}
