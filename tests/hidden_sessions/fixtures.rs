//! Scripted transport and host for the integration tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use portal_monitor::config::{MemoryToolCache, MonitorSettings, ToolCacheStore};
use portal_monitor::transport::{
    CloseCallback, CloseNotifier, CommandResult, Connection, Transport,
};
use portal_monitor::{HiddenSessions, HostContext, MonitorError, MonitorEvent, TargetId};

pub const PROCFS_OUTPUT: &str = "\
0.25 0.40 0.35 3/412 9001
--
MemTotal:        4028180 kB
MemFree:          312044 kB
MemAvailable:    2611320 kB
SwapTotal:             0 kB
SwapFree:              0 kB
--
86400.12 170000.00
--
2
";

pub const PS_OUTPUT: &str = "\
    PID    PPID USER     %CPU %MEM   RSS STAT     ELAPSED COMMAND
      1       0 root      0.0  0.2  9876 Ss       1-00:00:00 systemd
    702       1 postgres  7.5  4.0 163840 Ss         10:00:00 postgres
    915       1 www-data 21.0  1.5 61440 S          09:59:58 nginx
";

pub const SS_OUTPUT: &str = "\
tcp   LISTEN 0      511        0.0.0.0:80         0.0.0.0:*     users:((\"nginx\",pid=915,fd=6))
tcp   ESTAB  0      0          10.1.0.4:22        10.1.0.1:40022
";

#[derive(Default)]
struct Script {
    responses: HashMap<String, (i32, String, Duration)>,
    executed: Vec<String>,
}

/// Transport whose connections answer commands by longest matching prefix.
/// Unscripted commands exit 127.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    connect_delay: Mutex<Duration>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A Linux host with procfs, procps and ss.
    pub fn linux() -> Arc<Self> {
        let transport = Self::new();
        transport.respond("test -r /proc/loadavg", 0, "");
        transport.respond("cat /proc/loadavg", 0, PROCFS_OUTPUT);
        transport.respond("ps -eo pid,pcpu", 0, "");
        transport.respond("ps -eo pid,ppid", 0, PS_OUTPUT);
        transport.respond("command -v ss", 0, "/usr/bin/ss\n");
        transport.respond("ss -H", 0, SS_OUTPUT);
        transport
    }

    pub fn respond(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.respond_after(prefix, exit_code, stdout, Duration::ZERO);
    }

    pub fn respond_after(&self, prefix: &str, exit_code: i32, stdout: &str, delay: Duration) {
        self.script
            .lock()
            .responses
            .insert(prefix.to_string(), (exit_code, stdout.to_string(), delay));
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn executed(&self, prefix: &str) -> usize {
        self.script
            .lock()
            .executed
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Every connection that is neither closed by us nor dropped remotely.
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn drop_all_remote(&self) {
        for connection in self.connections.lock().iter() {
            connection.closed.store(true, Ordering::SeqCst);
            connection.notifier.fire();
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect<'a>(
        &'a self,
        _target: &'a TargetId,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, MonitorError>> {
        async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let delay = *self.connect_delay.lock();
            tokio::time::sleep(delay).await;

            let connection = Arc::new(ScriptedConnection {
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

pub struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    notifier: CloseNotifier,
}

impl std::fmt::Debug for ScriptedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedConnection").finish_non_exhaustive()
    }
}

impl Connection for ScriptedConnection {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandResult, MonitorError>> {
        async move {
            let response = {
                let mut script = self.script.lock();
                script.executed.push(command.to_string());
                script
                    .responses
                    .iter()
                    .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
                    .max_by_key(|(prefix, _)| prefix.len())
                    .map(|(_, response)| response.clone())
            };

            let Some((exit_code, stdout, delay)) = response else {
                return Ok(CommandResult {
                    stdout: String::new(),
                    stderr: format!("sh: 1: {}: not found", command),
                    exit_code: 127,
                });
            };
            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(MonitorError::Transport("channel closed".to_string()));
            }
            Ok(CommandResult {
                stdout,
                stderr: String::new(),
                exit_code,
            })
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

/// Host application with a user session that can be ended.
pub struct TestHost {
    pub session_open: AtomicBool,
}

impl HostContext for TestHost {
    fn is_primary_session_alive(&self, _target: &TargetId) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }

    fn is_receiver_alive(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub host: Arc<TestHost>,
    pub store: Arc<dyn ToolCacheStore>,
    pub sessions: Arc<HiddenSessions>,
    pub events: mpsc::Receiver<MonitorEvent>,
}

impl Harness {
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        Self::with_settings(transport, MonitorSettings::default())
    }

    pub fn with_settings(transport: Arc<ScriptedTransport>, settings: MonitorSettings) -> Self {
        Self::with_store(transport, settings, Arc::new(MemoryToolCache::new()))
    }

    pub fn with_store(
        transport: Arc<ScriptedTransport>,
        settings: MonitorSettings,
        store: Arc<dyn ToolCacheStore>,
    ) -> Self {
        let host = Arc::new(TestHost {
            session_open: AtomicBool::new(true),
        });
        let (tx, events) = mpsc::channel(settings.event_buffer);
        let sessions = Arc::new(HiddenSessions::new(
            transport.clone(),
            host.clone(),
            store.clone(),
            &settings,
            tx,
        ));

        Self {
            transport,
            host,
            store,
            sessions,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
