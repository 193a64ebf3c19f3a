//! Portal hidden-session monitor library
//!
//! Keeps auxiliary SSH connections next to a user's interactive session and
//! uses them for background telemetry (system, process and network) and
//! one-off diagnostic commands, without ever touching the interactive
//! channel.

pub mod adhoc;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod hidden;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod role;
pub mod shutdown;
pub mod transport;

pub(crate) mod security_log;

#[cfg(test)]
mod testing;

pub use adhoc::{AdhocSessionManager, ProcessDetails, Signal};
pub use context::HostContext;
pub use error::MonitorError;
pub use event::MonitorEvent;
pub use hidden::HiddenSessions;
pub use monitor::{MonitorController, MonitorState, Snapshot};
pub use pool::ConnectionPool;
pub use role::{Role, TargetId};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
