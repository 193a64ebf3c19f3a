//! Process table telemetry from `ps`

use std::cmp::Ordering;

use super::snapshot::{ParseError, ProcessEntry, ProcessSnapshot, Snapshot};
use super::{MonitorKind, ToolCandidate};
use crate::role::Role;

const CANDIDATES: &[ToolCandidate] = &[
    ToolCandidate {
        id: "procps",
        check: "ps -eo pid,pcpu >/dev/null 2>&1",
    },
    ToolCandidate {
        id: "busybox",
        check: "ps -o pid,vsz >/dev/null 2>&1",
    },
];

const PROCPS_COMMAND: &str = "ps -eo pid,ppid,user,pcpu,pmem,rss,stat,etime,comm";
const BUSYBOX_COMMAND: &str = "ps -o pid,ppid,user,vsz,stat,comm";

#[derive(Debug)]
pub struct ProcessMonitor {
    max_processes: usize,
}

impl ProcessMonitor {
    pub fn new(max_processes: usize) -> Self {
        Self { max_processes }
    }
}

impl MonitorKind for ProcessMonitor {
    fn role(&self) -> Role {
        Role::Process
    }

    fn candidates(&self) -> &'static [ToolCandidate] {
        CANDIDATES
    }

    fn command(&self, tool: &str) -> Option<String> {
        match tool {
            "procps" => Some(PROCPS_COMMAND.to_string()),
            "busybox" => Some(BUSYBOX_COMMAND.to_string()),
            _ => None,
        }
    }

    fn parse(&self, tool: &str, stdout: &str) -> Result<Snapshot, ParseError> {
        let parse_line = match tool {
            "procps" => parse_procps_line,
            "busybox" => parse_busybox_line,
            other => return Err(ParseError::new(other, "not a process tool")),
        };

        let mut processes: Vec<ProcessEntry> = stdout.lines().filter_map(parse_line).collect();
        if processes.is_empty() {
            return Err(ParseError::new(tool, "no process rows"));
        }

        let total = processes.len();
        processes.sort_by(|a, b| {
            b.cpu_percent
                .unwrap_or(0.0)
                .partial_cmp(&a.cpu_percent.unwrap_or(0.0))
                .unwrap_or(Ordering::Equal)
        });
        processes.truncate(self.max_processes);

        Ok(Snapshot::Process(ProcessSnapshot {
            tool: tool.to_string(),
            total,
            processes,
        }))
    }
}

/// One row of `pid ppid user pcpu pmem rss stat etime command...`. The
/// header row and anything else without a numeric pid yield `None`.
pub(crate) fn parse_procps_line(line: &str) -> Option<ProcessEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }

    Some(ProcessEntry {
        pid: fields[0].parse().ok()?,
        ppid: fields[1].parse().ok(),
        user: fields[2].to_string(),
        cpu_percent: fields[3].parse().ok(),
        mem_percent: fields[4].parse().ok(),
        rss_kb: fields[5].parse().ok(),
        vsz_kb: None,
        state: fields[6].to_string(),
        elapsed: Some(fields[7].to_string()),
        command: fields[8..].join(" "),
    })
}

/// One row of busybox `pid ppid user vsz stat command...`.
fn parse_busybox_line(line: &str) -> Option<ProcessEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }

    Some(ProcessEntry {
        pid: fields[0].parse().ok()?,
        ppid: fields[1].parse().ok(),
        user: fields[2].to_string(),
        cpu_percent: None,
        mem_percent: None,
        rss_kb: None,
        vsz_kb: parse_busybox_size(fields[3]),
        state: fields[4].to_string(),
        elapsed: None,
        command: fields[5..].join(" "),
    })
}

/// busybox prints sizes in KiB with an optional `m`/`g` suffix.
fn parse_busybox_size(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    let (digits, factor) = if let Some(v) = lower.strip_suffix('g') {
        (v, 1024.0 * 1024.0)
    } else if let Some(v) = lower.strip_suffix('m') {
        (v, 1024.0)
    } else {
        (lower.as_str(), 1.0)
    };
    digits.parse::<f64>().ok().map(|v| (v * factor) as u64)
}
