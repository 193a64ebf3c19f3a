//! In-process doubles for the transport and host application.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::context::HostContext;
use crate::error::MonitorError;
use crate::role::{Role, TargetId};
use crate::transport::{CloseCallback, CloseNotifier, CommandResult, Connection, Transport};

#[derive(Clone)]
struct Scripted {
    result: Result<CommandResult, MonitorError>,
    delay: Duration,
}

#[derive(Default)]
struct Script {
    /// command prefix -> response; longest matching prefix wins
    responses: HashMap<String, Scripted>,
    executed: Vec<String>,
}

/// Transport whose commands answer from a script.
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
    connect_delay: Mutex<Duration>,
    fail_connects: AtomicBool,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Mutex::new(Script::default())),
            connect_delay: Mutex::new(Duration::ZERO),
            fail_connects: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Answer commands starting with `prefix` with `stdout` and `exit_code`.
    pub fn respond(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.respond_after(prefix, exit_code, stdout, Duration::ZERO);
    }

    pub fn respond_after(&self, prefix: &str, exit_code: i32, stdout: &str, delay: Duration) {
        self.script.lock().responses.insert(
            prefix.to_string(),
            Scripted {
                result: Ok(CommandResult {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_code,
                }),
                delay,
            },
        );
    }

    pub fn respond_error(&self, prefix: &str, error: MonitorError) {
        self.script.lock().responses.insert(
            prefix.to_string(),
            Scripted {
                result: Err(error),
                delay: Duration::ZERO,
            },
        );
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// How many executed commands start with `prefix`.
    pub fn exec_count(&self, prefix: &str) -> usize {
        self.script
            .lock()
            .executed
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

impl Transport for MockTransport {
    fn connect<'a>(
        &'a self,
        _target: &'a TargetId,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, MonitorError>> {
        async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let delay = *self.connect_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_connects.load(Ordering::SeqCst) {
                return Err(MonitorError::Transport("connection refused".to_string()));
            }
            let connection = Arc::new(MockConnection {
                script: self.script.clone(),
                closes: self.closes.clone(),
                closed: AtomicBool::new(false),
                notifier: CloseNotifier::new(),
            });
            self.connections.lock().push(connection.clone());
            Ok(connection as Arc<dyn Connection>)
        }
        .boxed()
    }
}

pub struct MockConnection {
    script: Arc<Mutex<Script>>,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    notifier: CloseNotifier,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockConnection {
    /// Simulate the remote end going away.
    pub fn drop_remote(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notifier.fire();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandResult, MonitorError>> {
        async move {
            let scripted = {
                let mut script = self.script.lock();
                script.executed.push(command.to_string());
                script
                    .responses
                    .iter()
                    .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
                    .max_by_key(|(prefix, _)| prefix.len())
                    .map(|(_, scripted)| scripted.clone())
            };

            let Some(scripted) = scripted else {
                return Ok(CommandResult {
                    stdout: String::new(),
                    stderr: format!("sh: {}: not found", command),
                    exit_code: 127,
                });
            };

            if !scripted.delay.is_zero() {
                tokio::time::sleep(scripted.delay).await;
            }
            if self.is_closed() {
                return Err(MonitorError::Transport("connection closed".to_string()));
            }
            scripted.result
        }
        .boxed()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.notifier.register(callback);
    }

    fn close(&self) -> BoxFuture<'_, Result<(), MonitorError>> {
        async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.notifier.disarm();
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
        .boxed()
    }
}

/// Host application whose liveness answers can be flipped from tests.
pub struct MockHost {
    primary: AtomicBool,
    receiver: AtomicBool,
    disabled: Mutex<HashSet<Role>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            primary: AtomicBool::new(true),
            receiver: AtomicBool::new(true),
            disabled: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_primary_alive(&self, alive: bool) {
        self.primary.store(alive, Ordering::SeqCst);
    }

    pub fn set_receiver_alive(&self, alive: bool) {
        self.receiver.store(alive, Ordering::SeqCst);
    }

    pub fn disable_role(&self, role: Role) {
        self.disabled.lock().insert(role);
    }
}

impl HostContext for MockHost {
    fn is_primary_session_alive(&self, _target: &TargetId) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn is_receiver_alive(&self) -> bool {
        self.receiver.load(Ordering::SeqCst)
    }

    fn is_role_enabled(&self, _target: &TargetId, role: Role) -> bool {
        !self.disabled.lock().contains(&role)
    }
}
