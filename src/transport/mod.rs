//! Transport abstraction for hidden sessions.
//!
//! The pool and monitors only ever talk to [`Transport`] and [`Connection`];
//! [`ssh::SshTransport`] is the russh-backed implementation used by the
//! application.

pub mod auth;
pub mod handler;
pub mod ssh;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::timeout;

use crate::error::MonitorError;
use crate::role::TargetId;

pub use ssh::{HiddenAuth, HiddenHost, SshTransport};

/// Result of executing a command, including output and exit code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Callback invoked once when a connection closes without being asked to.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// A live connection to one target.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Run a command on a fresh channel and collect its output.
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandResult, MonitorError>>;

    /// Register a callback for remote-initiated close. Fires immediately if
    /// the connection is already gone.
    fn on_close(&self, callback: CloseCallback);

    fn close(&self) -> BoxFuture<'_, Result<(), MonitorError>>;
}

/// Opens connections to targets.
pub trait Transport: Send + Sync {
    fn connect<'a>(
        &'a self,
        target: &'a TargetId,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, MonitorError>>;
}

/// Run `command` with a hard deadline. Exceeding it yields
/// [`MonitorError::Timeout`].
pub async fn exec_with_timeout(
    connection: &dyn Connection,
    command: &str,
    limit: Duration,
) -> Result<CommandResult, MonitorError> {
    match timeout(limit, connection.exec(command)).await {
        Ok(result) => result,
        Err(_) => Err(MonitorError::Timeout {
            command: command.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Fan-out of close callbacks that fires at most once.
pub struct CloseNotifier {
    callbacks: Mutex<Option<Vec<CloseCallback>>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn register(&self, callback: CloseCallback) {
        let mut guard = self.callbacks.lock();
        match guard.as_mut() {
            Some(callbacks) => callbacks.push(callback),
            None => {
                drop(guard);
                callback();
            }
        }
    }

    /// Fire every registered callback. Returns false if already fired.
    pub fn fire(&self) -> bool {
        let callbacks = self.callbacks.lock().take();
        match callbacks {
            Some(callbacks) => {
                for callback in callbacks {
                    callback();
                }
                true
            }
            None => false,
        }
    }

    /// Drop pending callbacks without running them (used for requested closes).
    pub fn disarm(&self) {
        self.callbacks.lock().take();
    }

    pub fn has_fired(&self) -> bool {
        self.callbacks.lock().is_none()
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseNotifier")
            .field("fired", &self.has_fired())
            .finish()
    }
}
