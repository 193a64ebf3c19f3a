use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::role::Role;

/// Hidden-session settings stored in monitor.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSettings {
    /// Settle time after a primary session opens before the first hidden connect
    #[serde(default = "default_start_delay")]
    pub start_delay_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Hard limit for every remote command
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_ms: u64,
    /// Consecutive failed polls before the connection is recycled
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_adhoc_idle_timeout")]
    pub adhoc_idle_timeout_ms: u64,
    /// Emit a probe execution log for every poll
    #[serde(default)]
    pub diagnostics: bool,
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub roles: RoleToggles,
    #[serde(default)]
    pub ssh: SshSettings,
}

fn default_true() -> bool {
    true
}

fn default_start_delay() -> u64 {
    200
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_exec_timeout() -> u64 {
    20_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_adhoc_idle_timeout() -> u64 {
    30_000
}

fn default_max_processes() -> usize {
    200
}

fn default_event_buffer() -> usize {
    256
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            start_delay_ms: default_start_delay(),
            poll_interval_ms: default_poll_interval(),
            exec_timeout_ms: default_exec_timeout(),
            failure_threshold: default_failure_threshold(),
            adhoc_idle_timeout_ms: default_adhoc_idle_timeout(),
            diagnostics: false,
            max_processes: default_max_processes(),
            event_buffer: default_event_buffer(),
            roles: RoleToggles::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl MonitorSettings {
    /// Load from the default location, creating the file if it does not exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::paths::settings_file().ok_or_else(|| ConfigError::ReadFile {
            path: PathBuf::from("monitor.toml"),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine settings file path",
            ),
        })?;

        if !path.exists() {
            let settings = Self::default();
            super::paths::ensure_config_dir().map_err(ConfigError::CreateDir)?;
            settings.save_to(&path)?;
            return Ok(settings);
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!("Loading monitor settings from: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        super::write_atomic(path, &content).map_err(|e| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Never zero; `tokio::time::interval` panics on a zero period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms.max(1))
    }

    pub fn adhoc_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.adhoc_idle_timeout_ms)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}

/// Per-role switches; a disabled role fails `ensure()` with a precondition error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleToggles {
    #[serde(default = "default_true")]
    pub system: bool,
    #[serde(default = "default_true")]
    pub process: bool,
    #[serde(default = "default_true")]
    pub network: bool,
}

impl Default for RoleToggles {
    fn default() -> Self {
        Self {
            system: true,
            process: true,
            network: true,
        }
    }
}

impl RoleToggles {
    pub fn is_enabled(&self, role: Role) -> bool {
        match role {
            Role::System => self.system,
            Role::Process => self.process,
            Role::Network => self.network,
            Role::Adhoc => true,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshSettings {
    #[serde(default = "default_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive(),
        }
    }
}
