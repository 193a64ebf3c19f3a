//! Short-lived hidden connections for one-off commands
//!
//! Command handlers borrow an ad-hoc connection per target. Each successful
//! acquisition restarts an idle timer; when it runs out the connection is
//! closed and forgotten.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::MonitorError;
use crate::monitor::parse_procps_line;
use crate::pool::ConnectionPool;
use crate::role::{Role, TargetId};
use crate::transport::{exec_with_timeout, CommandResult, Connection};

/// Signals that may be sent to a remote process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Term,
    Kill,
    Hup,
    Int,
    Stop,
    Cont,
    Usr1,
    Usr2,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
            Signal::Hup => "HUP",
            Signal::Int => "INT",
            Signal::Stop => "STOP",
            Signal::Cont => "CONT",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIG{}", self.as_str())
    }
}

/// Detailed view of a single remote process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub user: String,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub rss_kb: Option<u64>,
    pub state: String,
    pub elapsed: Option<String>,
    /// Full command line with arguments
    pub command_line: String,
}

struct AdhocHandle {
    connection: Arc<dyn Connection>,
    last_used_at: Instant,
    idle_timer: JoinHandle<()>,
    epoch: u64,
}

struct AdhocInner {
    pool: ConnectionPool,
    idle_timeout: Duration,
    exec_timeout: Duration,
    handles: Mutex<HashMap<TargetId, AdhocHandle>>,
    epochs: AtomicU64,
}

/// Ad-hoc connections with idle expiry
#[derive(Clone)]
pub struct AdhocSessionManager {
    inner: Arc<AdhocInner>,
}

impl std::fmt::Debug for AdhocSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdhocSessionManager")
            .field("active", &self.inner.handles.lock().len())
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

impl AdhocSessionManager {
    pub fn new(pool: ConnectionPool, idle_timeout: Duration, exec_timeout: Duration) -> Self {
        debug_assert_eq!(pool.role(), Role::Adhoc);

        let inner = Arc::new(AdhocInner {
            pool,
            idle_timeout,
            exec_timeout,
            handles: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        });

        let observer: Weak<AdhocInner> = Arc::downgrade(&inner);
        inner.pool.set_close_observer(Arc::new(move |target: &TargetId| {
            if let Some(inner) = observer.upgrade() {
                if inner.forget(target) {
                    tracing::debug!("Dropped ad-hoc handle for {} after remote close", target);
                }
            }
        }));

        Self { inner }
    }

    /// Acquire the ad-hoc connection for `target` and restart its idle timer.
    pub async fn ensure(&self, target: &TargetId) -> Result<Arc<dyn Connection>, MonitorError> {
        let connection = self.inner.pool.ensure(target).await?;
        self.inner.touch(*target, connection.clone());
        Ok(connection)
    }

    pub fn is_active(&self, target: &TargetId) -> bool {
        self.inner.handles.lock().contains_key(target)
    }

    /// Time since the connection for `target` was last acquired.
    pub fn idle_for(&self, target: &TargetId) -> Option<Duration> {
        self.inner
            .handles
            .lock()
            .get(target)
            .map(|handle| handle.last_used_at.elapsed())
    }

    /// Cancel the idle timer and close the connection.
    pub async fn stop(&self, target: &TargetId) {
        self.inner.forget(target);
        self.inner.pool.close(target).await;
    }

    /// Like [`stop`](Self::stop), also waiting out a pending establishment.
    pub async fn drain(&self, target: &TargetId) {
        self.inner.forget(target);
        self.inner.pool.drain(target).await;
    }

    pub fn tracked_targets(&self) -> HashSet<TargetId> {
        let mut targets = self.inner.pool.tracked_targets();
        targets.extend(self.inner.handles.lock().keys().copied());
        targets
    }

    /// Run one command. A timeout closes the connection.
    pub async fn exec(
        &self,
        target: &TargetId,
        command: &str,
    ) -> Result<CommandResult, MonitorError> {
        let connection = self.ensure(target).await?;
        match exec_with_timeout(connection.as_ref(), command, self.inner.exec_timeout).await {
            Err(e) if e.is_timeout() => {
                tracing::warn!("Ad-hoc command on {} timed out, closing connection", target);
                self.stop(target).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Look up one process; `None` when it no longer exists.
    pub async fn process_details(
        &self,
        target: &TargetId,
        pid: u32,
    ) -> Result<Option<ProcessDetails>, MonitorError> {
        let command = format!(
            "ps -o pid=,ppid=,user=,pcpu=,pmem=,rss=,stat=,etime=,args= -p {}",
            pid
        );
        let output = self.exec(target, &command).await?;

        let entry = output
            .stdout
            .lines()
            .filter_map(parse_procps_line)
            .find(|entry| entry.pid == pid);

        match entry {
            Some(entry) => Ok(Some(ProcessDetails {
                pid: entry.pid,
                ppid: entry.ppid,
                user: entry.user,
                cpu_percent: entry.cpu_percent,
                mem_percent: entry.mem_percent,
                rss_kb: entry.rss_kb,
                state: entry.state,
                elapsed: entry.elapsed,
                command_line: entry.command,
            })),
            // ps exits 1 when nothing matched
            None if output.exit_code <= 1 => Ok(None),
            None => Err(MonitorError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    pub async fn signal_process(
        &self,
        target: &TargetId,
        pid: u32,
        signal: Signal,
    ) -> Result<(), MonitorError> {
        if pid == 0 {
            return Err(MonitorError::Precondition(
                "refusing to signal process group 0".to_string(),
            ));
        }

        let command = format!("kill -{} {}", signal.as_str(), pid);
        let output = self.exec(target, &command).await?;
        if !output.success() {
            return Err(MonitorError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        tracing::info!("Sent {} to pid {} on {}", signal, pid, target);
        Ok(())
    }

    /// Run `lines` as one compound command that stops at the first failure.
    pub async fn run_script<S: AsRef<str>>(
        &self,
        target: &TargetId,
        lines: &[S],
    ) -> Result<CommandResult, MonitorError> {
        let script = lines
            .iter()
            .map(|line| line.as_ref().trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" && ");
        if script.is_empty() {
            return Err(MonitorError::Precondition("empty script".to_string()));
        }

        self.exec(target, &script).await
    }
}

impl AdhocInner {
    fn touch(self: &Arc<Self>, target: TargetId, connection: Arc<dyn Connection>) {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::downgrade(self);
        let idle_timeout = self.idle_timeout;

        let idle_timer = tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire(&target, epoch).await;
            }
        });

        let previous = self.handles.lock().insert(
            target,
            AdhocHandle {
                connection,
                last_used_at: Instant::now(),
                idle_timer,
                epoch,
            },
        );
        if let Some(previous) = previous {
            previous.idle_timer.abort();
        }
    }

    async fn expire(&self, target: &TargetId, epoch: u64) {
        let expired = {
            let mut handles = self.handles.lock();
            match handles.get(target) {
                Some(handle) if handle.epoch == epoch => handles.remove(target),
                _ => None,
            }
        };
        let Some(handle) = expired else {
            return;
        };

        tracing::debug!(
            "Ad-hoc connection to {} idle for {:?}, releasing",
            target,
            self.idle_timeout
        );
        self.pool.release(target, &handle.connection).await;
    }

    /// Drop the handle and its timer. Returns whether one existed.
    fn forget(&self, target: &TargetId) -> bool {
        match self.handles.lock().remove(target) {
            Some(handle) => {
                handle.idle_timer.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for AdhocInner {
    fn drop(&mut self) {
        for (_, handle) in self.handles.get_mut().drain() {
            handle.idle_timer.abort();
        }
    }
}
