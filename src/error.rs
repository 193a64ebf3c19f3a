use std::path::PathBuf;
use thiserror::Error;

use crate::role::{Role, TargetId};

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),
}

/// SSH-related errors raised inside the russh transport
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Timeout connecting to {0}")]
    Timeout(String),

    #[error("SSH agent error: {0}")]
    Agent(String),

    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("russh error: {0}")]
    Russh(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Russh(err.to_string())
    }
}

/// Errors surfaced by hidden-session operations.
///
/// `Clone` because a single establishment result is handed to every caller
/// waiting on the same pending connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("No usable {role} tool found on {target}")]
    ToolNotFound { role: Role, target: TargetId },

    #[error("Command '{command}' timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection to {0} was discarded because it was closed while connecting")]
    Discarded(TargetId),

    #[error("Command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },
}

impl MonitorError {
    /// Timeouts signal a wedged transport and always force a reconnect.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MonitorError::Timeout { .. })
    }
}

impl From<SshError> for MonitorError {
    fn from(err: SshError) -> Self {
        MonitorError::Transport(err.to_string())
    }
}
