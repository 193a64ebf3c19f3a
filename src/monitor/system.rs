//! Load, memory and uptime telemetry
//!
//! Linux hosts are read straight from procfs. BSD and macOS hosts go through
//! `sysctl` and `vm_stat`. Both commands print their sources as sections
//! separated by a `--` line so one round trip covers the whole snapshot.

use std::sync::LazyLock;

use regex::Regex;

use super::snapshot::{ParseError, Snapshot, SystemSnapshot};
use super::{MonitorKind, ToolCandidate};
use crate::role::Role;

const SECTION_MARKER: &str = "--";

const CANDIDATES: &[ToolCandidate] = &[
    ToolCandidate {
        id: "procfs",
        check: "test -r /proc/loadavg && test -r /proc/meminfo",
    },
    ToolCandidate {
        id: "sysctl",
        check: "command -v sysctl >/dev/null 2>&1",
    },
];

const PROCFS_COMMAND: &str = "cat /proc/loadavg; echo '--'; cat /proc/meminfo; echo '--'; \
    cat /proc/uptime; echo '--'; grep -c '^cpu[0-9]' /proc/stat";

const SYSCTL_COMMAND: &str = "sysctl -n vm.loadavg; sysctl -n hw.ncpu; \
    sysctl -n hw.memsize 2>/dev/null || sysctl -n hw.physmem; sysctl -n kern.boottime; \
    echo '--'; date +%s; echo '--'; sysctl -n vm.swapusage 2>/dev/null; \
    echo '--'; vm_stat 2>/dev/null";

static BOOT_TIME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sec\s*=\s*(\d+)").expect("boot time pattern is valid"));

static SWAP_USAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(total|free)\s*=\s*([\d.]+)([KMGT])").expect("swap usage pattern is valid")
});

static PAGE_SIZE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"page size of (\d+) bytes").expect("page size pattern is valid"));

#[derive(Debug, Default)]
pub struct SystemMonitor;

impl MonitorKind for SystemMonitor {
    fn role(&self) -> Role {
        Role::System
    }

    fn candidates(&self) -> &'static [ToolCandidate] {
        CANDIDATES
    }

    fn command(&self, tool: &str) -> Option<String> {
        match tool {
            "procfs" => Some(PROCFS_COMMAND.to_string()),
            "sysctl" => Some(SYSCTL_COMMAND.to_string()),
            _ => None,
        }
    }

    fn parse(&self, tool: &str, stdout: &str) -> Result<Snapshot, ParseError> {
        let snapshot = match tool {
            "procfs" => parse_procfs(stdout)?,
            "sysctl" => parse_sysctl(stdout)?,
            other => return Err(ParseError::new(other, "not a system tool")),
        };
        Ok(Snapshot::System(snapshot))
    }
}

fn sections(stdout: &str) -> Vec<Vec<&str>> {
    let mut sections = vec![Vec::new()];
    for line in stdout.lines() {
        let line = line.trim();
        if line == SECTION_MARKER {
            sections.push(Vec::new());
        } else if !line.is_empty() {
            if let Some(current) = sections.last_mut() {
                current.push(line);
            }
        }
    }
    sections
}

fn parse_load_average(fields: &[&str], tool: &str) -> Result<[f64; 3], ParseError> {
    let values = fields
        .iter()
        .take(3)
        .map(|v| v.parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ParseError::new(tool, format!("bad load average: {}", e)))?;

    match values.as_slice() {
        [one, five, fifteen] => Ok([*one, *five, *fifteen]),
        _ => Err(ParseError::new(tool, "load average needs three values")),
    }
}

fn parse_procfs(stdout: &str) -> Result<SystemSnapshot, ParseError> {
    let sections = sections(stdout);
    let section = |i: usize| sections.get(i).map(Vec::as_slice).unwrap_or(&[]);

    let loadavg = section(0)
        .first()
        .ok_or_else(|| ParseError::new("procfs", "missing /proc/loadavg"))?;
    let load_fields: Vec<&str> = loadavg.split_whitespace().collect();
    let load_average = parse_load_average(&load_fields, "procfs")?;

    let meminfo_value = |key: &str| {
        section(1).iter().find_map(|line| {
            let (name, rest) = line.split_once(':')?;
            if name.trim() != key {
                return None;
            }
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };

    let memory_total_kb = meminfo_value("MemTotal")
        .ok_or_else(|| ParseError::new("procfs", "missing MemTotal"))?;
    // Kernels older than 3.14 have no MemAvailable.
    let memory_available_kb = meminfo_value("MemAvailable").or_else(|| {
        let free = meminfo_value("MemFree")?;
        Some(free + meminfo_value("Buffers").unwrap_or(0) + meminfo_value("Cached").unwrap_or(0))
    });

    let uptime_secs = section(2)
        .first()
        .and_then(|line| line.split_whitespace().next())
        .and_then(|v| v.parse::<f64>().ok())
        .map(|secs| secs as u64);

    let cpu_count = section(3).first().and_then(|v| v.parse::<u32>().ok());

    Ok(SystemSnapshot {
        tool: "procfs".to_string(),
        load_average,
        cpu_count,
        memory_total_kb,
        memory_available_kb,
        swap_total_kb: meminfo_value("SwapTotal"),
        swap_free_kb: meminfo_value("SwapFree"),
        uptime_secs,
    })
}

fn parse_sysctl(stdout: &str) -> Result<SystemSnapshot, ParseError> {
    let sections = sections(stdout);
    let section = |i: usize| sections.get(i).map(Vec::as_slice).unwrap_or(&[]);
    let values = section(0);

    let loadavg = values
        .first()
        .ok_or_else(|| ParseError::new("sysctl", "missing vm.loadavg"))?;
    let load_fields: Vec<&str> = loadavg
        .split_whitespace()
        .filter(|f| *f != "{" && *f != "}")
        .collect();
    let load_average = parse_load_average(&load_fields, "sysctl")?;

    let cpu_count = values.get(1).and_then(|v| v.parse::<u32>().ok());
    let memory_total_kb = values
        .get(2)
        .and_then(|v| v.parse::<u64>().ok())
        .map(|bytes| bytes / 1024)
        .ok_or_else(|| ParseError::new("sysctl", "missing physical memory size"))?;

    let boot_time = values
        .get(3)
        .and_then(|v| BOOT_TIME_REGEX.captures(v))
        .and_then(|c| c[1].parse::<u64>().ok());
    let now = section(1).first().and_then(|v| v.parse::<u64>().ok());
    let uptime_secs = match (boot_time, now) {
        (Some(boot), Some(now)) => Some(now.saturating_sub(boot)),
        _ => None,
    };

    let (swap_total_kb, swap_free_kb) = section(2)
        .first()
        .map(|line| parse_swap_usage(line))
        .unwrap_or((None, None));

    Ok(SystemSnapshot {
        tool: "sysctl".to_string(),
        load_average,
        cpu_count,
        memory_total_kb,
        memory_available_kb: parse_vm_stat(section(3)),
        swap_total_kb,
        swap_free_kb,
        uptime_secs,
    })
}

/// `total = 2048.00M  used = 1024.00M  free = 1024.00M  (encrypted)`
fn parse_swap_usage(line: &str) -> (Option<u64>, Option<u64>) {
    let mut total = None;
    let mut free = None;
    for caps in SWAP_USAGE_REGEX.captures_iter(line) {
        let Ok(value) = caps[2].parse::<f64>() else {
            continue;
        };
        let kb = match &caps[3] {
            "K" => value,
            "M" => value * 1024.0,
            "G" => value * 1024.0 * 1024.0,
            _ => value * 1024.0 * 1024.0 * 1024.0,
        } as u64;
        match &caps[1] {
            "total" => total = Some(kb),
            _ => free = Some(kb),
        }
    }
    (total, free)
}

/// Free, inactive and speculative pages count as available.
fn parse_vm_stat(lines: &[&str]) -> Option<u64> {
    let header = lines.first()?;
    let page_size = PAGE_SIZE_REGEX
        .captures(header)
        .and_then(|c| c[1].parse::<u64>().ok())?;

    let pages = |key: &str| {
        lines.iter().find_map(|line| {
            let (name, rest) = line.split_once(':')?;
            if name.trim() != key {
                return None;
            }
            rest.trim().trim_end_matches('.').parse::<u64>().ok()
        })
    };

    let available = pages("Pages free")?
        + pages("Pages inactive").unwrap_or(0)
        + pages("Pages speculative").unwrap_or(0);
    Some(available * page_size / 1024)
}
