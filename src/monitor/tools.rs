//! Per-target tool detection with a write-through cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::MonitorKind;
use crate::config::ToolCacheStore;
use crate::error::MonitorError;
use crate::role::{Role, TargetId};
use crate::transport::{exec_with_timeout, Connection};

/// Remembers which tool serves each (target, role).
///
/// Detection happens once per target; later controllers, including ones
/// created after a restart when the store is file-backed, reuse the answer.
/// After [`invalidate`](Self::invalidate) the persisted value is no longer
/// trusted and the next resolution probes again.
pub struct ToolRegistry {
    store: Arc<dyn ToolCacheStore>,
    detected: Mutex<HashMap<(TargetId, Role), &'static str>>,
    stale: Mutex<HashSet<(TargetId, Role)>>,
    exec_timeout: Duration,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("detected", &self.detected.lock().len())
            .field("exec_timeout", &self.exec_timeout)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn ToolCacheStore>, exec_timeout: Duration) -> Self {
        Self {
            store,
            detected: Mutex::new(HashMap::new()),
            stale: Mutex::new(HashSet::new()),
            exec_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ToolCacheStore> {
        &self.store
    }

    /// The tool already known for `target`, without probing.
    pub fn cached(&self, target: &TargetId, role: Role) -> Option<&'static str> {
        self.detected.lock().get(&(*target, role)).copied()
    }

    /// Find the tool serving `kind` on `target`: memory first, then the
    /// external store, then existence checks in priority order.
    pub async fn resolve(
        &self,
        kind: &dyn MonitorKind,
        target: &TargetId,
        connection: &dyn Connection,
    ) -> Result<&'static str, MonitorError> {
        let role = kind.role();
        let key = (*target, role);

        if let Some(tool) = self.cached(target, role) {
            return Ok(tool);
        }

        if !self.stale.lock().contains(&key) {
            if let Some(stored) = self.store.read(target, role) {
                match kind.candidate(&stored) {
                    Some(candidate) => {
                        tracing::debug!("Using stored {} tool '{}' for {}", role, stored, target);
                        self.detected.lock().insert(key, candidate.id);
                        return Ok(candidate.id);
                    }
                    None => tracing::warn!(
                        "Ignoring stored {} tool '{}' for {}: not a known candidate",
                        role,
                        stored,
                        target
                    ),
                }
            }
        }

        for candidate in kind.candidates() {
            let result = exec_with_timeout(connection, candidate.check, self.exec_timeout).await?;
            if result.success() {
                tracing::info!("Detected {} tool '{}' on {}", role, candidate.id, target);
                self.detected.lock().insert(key, candidate.id);
                self.stale.lock().remove(&key);
                self.store.write(target, role, candidate.id);
                return Ok(candidate.id);
            }
            tracing::debug!(
                "{} tool '{}' unavailable on {} (exit {})",
                role,
                candidate.id,
                target,
                result.exit_code
            );
        }

        Err(MonitorError::ToolNotFound {
            role,
            target: *target,
        })
    }

    /// Forget the detected tool so the next resolution probes again.
    pub fn invalidate(&self, target: &TargetId, role: Role) {
        let key = (*target, role);
        if self.detected.lock().remove(&key).is_some() {
            tracing::debug!("Invalidated {} tool for {}", role, target);
        }
        self.stale.lock().insert(key);
        self.store.forget(target, role);
    }

    /// Drop in-memory knowledge about `target`. The store keeps its entries.
    pub fn forget_target(&self, target: &TargetId) {
        self.detected.lock().retain(|(t, _), _| t != target);
        self.stale.lock().retain(|(t, _)| t != target);
    }
}
