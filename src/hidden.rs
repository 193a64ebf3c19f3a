//! Registry of every hidden session the application owns
//!
//! One [`HiddenSessions`] lives for the whole application run. It owns a
//! connection pool per monitor role, the ad-hoc manager, the tool registry
//! and the controllers, created lazily per (target, role).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::adhoc::AdhocSessionManager;
use crate::config::{MonitorSettings, ToolCacheStore};
use crate::context::HostContext;
use crate::error::MonitorError;
use crate::event::{EventSink, MonitorEvent};
use crate::monitor::{self, MonitorController, MonitorKind, MonitorState, PollTiming, ToolRegistry};
use crate::pool::ConnectionPool;
use crate::role::{Role, TargetId};
use crate::transport::Transport;

pub struct HiddenSessions {
    host: Arc<dyn HostContext>,
    pools: HashMap<Role, ConnectionPool>,
    kinds: HashMap<Role, Arc<dyn MonitorKind>>,
    adhoc_pool: ConnectionPool,
    adhoc: AdhocSessionManager,
    tools: Arc<ToolRegistry>,
    controllers: Mutex<HashMap<(TargetId, Role), MonitorController>>,
    events: EventSink,
    timing: PollTiming,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for HiddenSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiddenSessions")
            .field("controllers", &self.controllers.lock().len())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl HiddenSessions {
    pub fn new(
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostContext>,
        store: Arc<dyn ToolCacheStore>,
        settings: &MonitorSettings,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        let mut pools = HashMap::new();
        let mut kinds = HashMap::new();
        for role in Role::MONITORS {
            pools.insert(
                role,
                ConnectionPool::new(
                    role,
                    transport.clone(),
                    host.clone(),
                    settings.roles.is_enabled(role),
                ),
            );
            if let Some(kind) = monitor::kind_for(role, settings) {
                kinds.insert(role, kind);
            }
        }

        let adhoc_pool = ConnectionPool::new(Role::Adhoc, transport, host.clone(), true);
        let adhoc = AdhocSessionManager::new(
            adhoc_pool.clone(),
            settings.adhoc_idle_timeout(),
            settings.exec_timeout(),
        );

        Self {
            host,
            pools,
            kinds,
            adhoc_pool,
            adhoc,
            tools: Arc::new(ToolRegistry::new(store, settings.exec_timeout())),
            controllers: Mutex::new(HashMap::new()),
            events: EventSink::new(events, settings.diagnostics),
            timing: PollTiming::from_settings(settings),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The controller for (target, role), created on first use.
    pub fn controller(&self, target: &TargetId, role: Role) -> Result<MonitorController, MonitorError> {
        if self.is_shut_down() {
            return Err(MonitorError::Precondition(
                "hidden sessions are shutting down".to_string(),
            ));
        }
        let (Some(pool), Some(kind)) = (self.pools.get(&role), self.kinds.get(&role)) else {
            return Err(MonitorError::Precondition(format!(
                "{} is not a monitor role",
                role
            )));
        };

        let mut controllers = self.controllers.lock();
        let controller = controllers.entry((*target, role)).or_insert_with(|| {
            MonitorController::new(
                *target,
                kind.clone(),
                pool.clone(),
                self.tools.clone(),
                self.host.clone(),
                self.events.clone(),
                self.timing,
            )
        });
        Ok(controller.clone())
    }

    pub async fn start_monitor(&self, target: &TargetId, role: Role) -> Result<(), MonitorError> {
        self.controller(target, role)?.start().await
    }

    pub async fn stop_monitor(&self, target: &TargetId, role: Role) {
        let controller = self.controllers.lock().get(&(*target, role)).cloned();
        match controller {
            Some(controller) => controller.stop().await,
            None => {
                if let Some(pool) = self.pools.get(&role) {
                    pool.close(target).await;
                }
            }
        }
    }

    pub fn monitor_state(&self, target: &TargetId, role: Role) -> MonitorState {
        self.controllers
            .lock()
            .get(&(*target, role))
            .map(MonitorController::state)
            .unwrap_or(MonitorState::Idle)
    }

    pub fn adhoc(&self) -> &AdhocSessionManager {
        &self.adhoc
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn tool_store(&self) -> &Arc<dyn ToolCacheStore> {
        self.tools.store()
    }

    /// Tear down everything held for `target`: controllers, pooled and
    /// pending connections, and the ad-hoc idle timer.
    pub async fn dispose_target(&self, target: &TargetId) {
        let controllers: Vec<MonitorController> = {
            let mut controllers = self.controllers.lock();
            let keys: Vec<_> = controllers
                .keys()
                .filter(|(t, _)| t == target)
                .copied()
                .collect();
            keys.iter().filter_map(|key| controllers.remove(key)).collect()
        };

        join_all(controllers.iter().map(MonitorController::stop)).await;
        join_all(self.pools.values().map(|pool| pool.drain(target))).await;
        self.adhoc.drain(target).await;
        self.tools.forget_target(target);

        tracing::debug!("Disposed hidden sessions for {}", target);
    }

    /// Every target with a controller, connection, pending establishment,
    /// cancellation mark or idle timer.
    pub fn tracked_targets(&self) -> HashSet<TargetId> {
        let mut targets: HashSet<TargetId> = self
            .controllers
            .lock()
            .keys()
            .map(|(target, _)| *target)
            .collect();
        for pool in self.pools.values() {
            targets.extend(pool.tracked_targets());
        }
        targets.extend(self.adhoc.tracked_targets());
        targets
    }

    /// Refuse all new connections from here on.
    pub fn begin_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in self.pools.values() {
            pool.shut_down();
        }
        self.adhoc_pool.shut_down();
        tracing::info!("Hidden sessions shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
