//! Socket telemetry from `ss`, `netstat` or `lsof`

use std::sync::LazyLock;

use regex::Regex;

use super::snapshot::{NetworkSnapshot, ParseError, Snapshot, SocketEntry};
use super::{MonitorKind, ToolCandidate};
use crate::role::Role;

const CANDIDATES: &[ToolCandidate] = &[
    ToolCandidate {
        id: "ss",
        check: "command -v ss >/dev/null 2>&1",
    },
    ToolCandidate {
        id: "netstat",
        check: "command -v netstat >/dev/null 2>&1",
    },
    ToolCandidate {
        id: "lsof",
        check: "command -v lsof >/dev/null 2>&1",
    },
];

static SS_USERS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"users:\(\("([^"]+)",pid=(\d+)"#).expect("ss users pattern is valid")
});

#[derive(Debug, Default)]
pub struct NetworkMonitor;

impl MonitorKind for NetworkMonitor {
    fn role(&self) -> Role {
        Role::Network
    }

    fn candidates(&self) -> &'static [ToolCandidate] {
        CANDIDATES
    }

    fn command(&self, tool: &str) -> Option<String> {
        let command = match tool {
            "ss" => "ss -H -tuna -p",
            "netstat" => "netstat -tuna",
            "lsof" => "lsof -nP -iTCP -iUDP",
            _ => return None,
        };
        Some(command.to_string())
    }

    fn parse(&self, tool: &str, stdout: &str) -> Result<Snapshot, ParseError> {
        let parse_line = match tool {
            "ss" => parse_ss_line,
            "netstat" => parse_netstat_line,
            "lsof" => parse_lsof_line,
            other => return Err(ParseError::new(other, "not a network tool")),
        };

        let mut snapshot = NetworkSnapshot {
            tool: tool.to_string(),
            ..Default::default()
        };
        let mut rows = 0usize;
        let mut rejected = 0usize;
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            rows += 1;
            match parse_line(line) {
                Some(entry) => snapshot.push(entry),
                None => rejected += 1,
            }
        }

        // Up to two header lines are normal; more than that with no socket
        // row is not output from this tool.
        if rows > 2 && rejected == rows {
            return Err(ParseError::new(tool, "no socket rows recognised"));
        }
        if rejected > 0 {
            tracing::trace!("{}: skipped {} non-socket lines", tool, rejected);
        }

        Ok(Snapshot::Network(snapshot))
    }
}

/// `*:*`, `0.0.0.0:*`, `[::]:*` and friends mean "no peer".
fn peer_address(value: &str) -> Option<String> {
    if value.ends_with(":*") || value.ends_with(".*") || value == "*" {
        None
    } else {
        Some(value.to_string())
    }
}

/// `tcp ESTAB 0 0 10.0.0.2:22 10.0.0.9:51000 users:(("sshd",pid=1234,fd=4))`
fn parse_ss_line(line: &str) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 || fields[0] == "Netid" {
        return None;
    }
    let protocol = fields[0];
    if !protocol.starts_with("tcp") && !protocol.starts_with("udp") {
        return None;
    }

    let (process, pid) = match SS_USERS_REGEX.captures(line) {
        Some(caps) => (Some(caps[1].to_string()), caps[2].parse().ok()),
        None => (None, None),
    };

    Some(SocketEntry {
        protocol: protocol.to_string(),
        local: fields[4].to_string(),
        remote: peer_address(fields[5]),
        state: fields[1].to_string(),
        pid,
        process,
    })
}

/// `tcp 0 0 0.0.0.0:22 0.0.0.0:* LISTEN`; udp rows carry no state column.
fn parse_netstat_line(line: &str) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let protocol = fields[0];
    if !protocol.starts_with("tcp") && !protocol.starts_with("udp") {
        return None;
    }

    let state = fields
        .get(5)
        .map(|s| s.to_string())
        .unwrap_or_else(|| "UNCONN".to_string());

    Some(SocketEntry {
        protocol: protocol.to_string(),
        local: fields[3].to_string(),
        remote: peer_address(fields[4]),
        state,
        pid: None,
        process: None,
    })
}

/// `sshd 812 root 3u IPv4 21345 0t0 TCP *:22 (LISTEN)`
fn parse_lsof_line(line: &str) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let node = fields
        .iter()
        .position(|f| *f == "TCP" || *f == "UDP")?;
    let pid = fields.get(1)?.parse::<u32>().ok()?;
    let name = fields.get(node + 1)?;

    let (local, remote) = match name.split_once("->") {
        Some((local, remote)) => (local.to_string(), Some(remote.to_string())),
        None => (name.to_string(), None),
    };
    let state = fields
        .get(node + 2)
        .map(|s| s.trim_matches(|c| c == '(' || c == ')').to_string())
        .unwrap_or_else(|| "UNCONN".to_string());

    Some(SocketEntry {
        protocol: fields[node].to_ascii_lowercase(),
        local,
        remote,
        state,
        pid: Some(pid),
        process: Some(fields[0].to_string()),
    })
}
