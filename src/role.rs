//! Identity types shared by every hidden-session component.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a remote endpoint, as registered by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable id for `user@host:port`, so persisted tool detections carry
    /// over between runs against the same destination.
    pub fn for_destination(username: &str, hostname: &str, port: u16) -> Self {
        let name = format!("{}@{}:{}", username, hostname.to_ascii_lowercase(), port);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TargetId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Purpose of a hidden connection. Each role gets its own pool, so one
/// target may hold up to four hidden connections at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Process,
    Network,
    Adhoc,
}

impl Role {
    /// Roles driven by a polling monitor.
    pub const MONITORS: [Role; 3] = [Role::System, Role::Process, Role::Network];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Process => "process",
            Role::Network => "network",
            Role::Adhoc => "adhoc",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "system" | "sys" => Some(Role::System),
            "process" | "proc" | "processes" => Some(Role::Process),
            "network" | "net" => Some(Role::Network),
            "adhoc" => Some(Role::Adhoc),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
