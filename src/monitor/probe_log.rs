//! Diagnostic record of each probe execution
//!
//! Stored output is bounded and obvious secrets are redacted before the
//! record leaves the monitor.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::role::Role;
use crate::transport::CommandResult;

const MAX_OUTPUT_LEN: usize = 16 * 1024;
const MAX_ERROR_LEN: usize = 1024;

static REDACTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|passphrase|token|secret|apikey|api_key)\b\s*[:=]\s*([^\s"']+)"#)
        .expect("redaction pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeExecutionLog {
    pub role: Role,
    pub tool: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ProbeExecutionLog {
    pub fn new(
        role: Role,
        tool: &str,
        command: &str,
        result: &Result<CommandResult, MonitorError>,
        duration: Duration,
    ) -> Self {
        let (stdout, exit_code, ok, error) = match result {
            Ok(output) => (
                sanitize_field(&output.stdout, MAX_OUTPUT_LEN),
                Some(output.exit_code),
                output.success(),
                (!output.success() && !output.stderr.is_empty())
                    .then(|| sanitize_field(output.stderr.trim(), MAX_ERROR_LEN)),
            ),
            Err(e) => (
                String::new(),
                None,
                false,
                Some(sanitize_field(&e.to_string(), MAX_ERROR_LEN)),
            ),
        };

        Self {
            role,
            tool: tool.to_string(),
            command: command.to_string(),
            stdout,
            exit_code,
            duration_ms: duration.as_millis() as u64,
            ok,
            error,
            executed_at: Utc::now(),
        }
    }
}

fn sanitize_field(value: &str, max_len: usize) -> String {
    let redacted = REDACTION_REGEX
        .replace_all(value, "$1=[REDACTED]")
        .to_string();
    truncate_string(&redacted, max_len)
}

fn truncate_string(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }

    let mut truncated = value.chars().take(max_len).collect::<String>();
    truncated.push_str("...");
    truncated
}
