//! Telemetry payloads produced by a successful poll.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output a tool produced that could not be turned into a snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unparseable {tool} output: {reason}")]
pub struct ParseError {
    pub tool: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(tool: &str, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// One poll's worth of telemetry for a single role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Snapshot {
    System(SystemSnapshot),
    Process(ProcessSnapshot),
    Network(NetworkSnapshot),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub tool: String,
    pub load_average: [f64; 3],
    pub cpu_count: Option<u32>,
    pub memory_total_kb: u64,
    pub memory_available_kb: Option<u64>,
    pub swap_total_kb: Option<u64>,
    pub swap_free_kb: Option<u64>,
    pub uptime_secs: Option<u64>,
}

impl SystemSnapshot {
    /// Share of memory in use, when availability is known.
    pub fn memory_used_percent(&self) -> Option<f64> {
        let available = self.memory_available_kb?;
        if self.memory_total_kb == 0 {
            return None;
        }
        let used = self.memory_total_kb.saturating_sub(available);
        Some(used as f64 * 100.0 / self.memory_total_kb as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub user: String,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub rss_kb: Option<u64>,
    pub vsz_kb: Option<u64>,
    pub state: String,
    pub elapsed: Option<String>,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub tool: String,
    /// Processes on the host before truncation
    pub total: usize,
    pub processes: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketEntry {
    pub protocol: String,
    pub local: String,
    pub remote: Option<String>,
    pub state: String,
    pub pid: Option<u32>,
    pub process: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub tool: String,
    pub listeners: Vec<SocketEntry>,
    pub connections: Vec<SocketEntry>,
}

impl NetworkSnapshot {
    /// File a socket under listeners or connections by its state.
    pub(crate) fn push(&mut self, entry: SocketEntry) {
        if is_listening_state(&entry.state) {
            self.listeners.push(entry);
        } else {
            self.connections.push(entry);
        }
    }
}

fn is_listening_state(state: &str) -> bool {
    matches!(
        state.to_ascii_uppercase().as_str(),
        "LISTEN" | "UNCONN" | "IDLE" | "BOUND"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_used_percent() {
        let snapshot = SystemSnapshot {
            memory_total_kb: 1000,
            memory_available_kb: Some(250),
            ..Default::default()
        };
        assert_eq!(snapshot.memory_used_percent(), Some(75.0));

        let unknown = SystemSnapshot {
            memory_total_kb: 1000,
            ..Default::default()
        };
        assert_eq!(unknown.memory_used_percent(), None);
    }

    #[test]
    fn sockets_are_filed_by_state() {
        let mut snapshot = NetworkSnapshot::default();
        snapshot.push(SocketEntry {
            protocol: "tcp".to_string(),
            local: "0.0.0.0:22".to_string(),
            state: "LISTEN".to_string(),
            ..Default::default()
        });
        snapshot.push(SocketEntry {
            protocol: "udp".to_string(),
            local: "0.0.0.0:68".to_string(),
            state: "UNCONN".to_string(),
            ..Default::default()
        });
        snapshot.push(SocketEntry {
            protocol: "tcp".to_string(),
            local: "10.0.0.2:22".to_string(),
            remote: Some("10.0.0.9:51000".to_string()),
            state: "ESTAB".to_string(),
            ..Default::default()
        });

        assert_eq!(snapshot.listeners.len(), 2);
        assert_eq!(snapshot.connections.len(), 1);
    }

    #[test]
    fn snapshot_serializes_with_kind_tag() {
        let snapshot = Snapshot::Network(NetworkSnapshot {
            tool: "ss".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["kind"], "network");
        assert_eq!(json["tool"], "ss");
    }
}
