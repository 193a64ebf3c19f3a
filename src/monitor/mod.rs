//! Background telemetry monitors
//!
//! A monitor kind knows which remote tools can serve its role, how to ask
//! each one for data and how to read the answer. [`MonitorController`] drives
//! a kind against one target through a pooled hidden connection.

mod controller;
mod network;
mod probe_log;
mod process;
mod snapshot;
mod system;
mod tools;

use std::sync::Arc;

pub use controller::{MonitorController, MonitorState, PollTiming};
pub use network::NetworkMonitor;
pub use probe_log::ProbeExecutionLog;
pub use process::ProcessMonitor;
pub use snapshot::{
    NetworkSnapshot, ParseError, ProcessEntry, ProcessSnapshot, Snapshot, SocketEntry,
    SystemSnapshot,
};
pub use system::SystemMonitor;
pub use tools::ToolRegistry;

pub(crate) use process::parse_procps_line;

use crate::config::MonitorSettings;
use crate::role::Role;

/// A remote tool that can serve a role, with the command that proves it is
/// installed (exit 0 means usable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCandidate {
    pub id: &'static str,
    pub check: &'static str,
}

/// Role-specific knowledge of a monitor.
pub trait MonitorKind: Send + Sync + 'static {
    fn role(&self) -> Role;

    /// Usable tools in priority order
    fn candidates(&self) -> &'static [ToolCandidate];

    fn command(&self, tool: &str) -> Option<String>;

    fn parse(&self, tool: &str, stdout: &str) -> Result<Snapshot, ParseError>;

    fn candidate(&self, tool: &str) -> Option<&'static ToolCandidate> {
        self.candidates().iter().find(|c| c.id == tool)
    }
}

/// The monitor kind serving `role`, or `None` for roles that do not poll.
pub fn kind_for(role: Role, settings: &MonitorSettings) -> Option<Arc<dyn MonitorKind>> {
    match role {
        Role::System => Some(Arc::new(SystemMonitor)),
        Role::Process => Some(Arc::new(ProcessMonitor::new(settings.max_processes))),
        Role::Network => Some(Arc::new(NetworkMonitor)),
        Role::Adhoc => None,
    }
}
