//! Persistent cache of detected remote tools
//!
//! Remembers which tool each monitor role settled on for a target so that
//! later sessions skip detection entirely.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::role::{Role, TargetId};

/// Pluggable storage for detected tools. Implementations must not block for
/// long; they are called from async contexts.
pub trait ToolCacheStore: Send + Sync {
    fn read(&self, target: &TargetId, role: Role) -> Option<String>;
    fn write(&self, target: &TargetId, role: Role, tool: &str);
    fn forget(&self, target: &TargetId, role: Role);
    /// Persist anything still buffered. Called last during shutdown.
    fn flush(&self) {}
}

/// Process-local store, used when nothing should touch disk
#[derive(Debug, Default)]
pub struct MemoryToolCache {
    entries: Mutex<HashMap<(TargetId, Role), String>>,
}

impl MemoryToolCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolCacheStore for MemoryToolCache {
    fn read(&self, target: &TargetId, role: Role) -> Option<String> {
        self.entries.lock().get(&(*target, role)).cloned()
    }

    fn write(&self, target: &TargetId, role: Role, tool: &str) {
        self.entries.lock().insert((*target, role), tool.to_string());
    }

    fn forget(&self, target: &TargetId, role: Role) {
        self.entries.lock().remove(&(*target, role));
    }
}

/// On-disk layout of monitor_tools.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCacheFile {
    /// target id -> role -> tool
    #[serde(default)]
    pub targets: BTreeMap<String, BTreeMap<String, String>>,
}

impl ToolCacheFile {
    fn get(&self, target: &TargetId, role: Role) -> Option<&String> {
        self.targets.get(&target.to_string())?.get(role.as_str())
    }

    fn set(&mut self, target: &TargetId, role: Role, tool: &str) -> bool {
        let roles = self.targets.entry(target.to_string()).or_default();
        roles.insert(role.as_str().to_string(), tool.to_string()).as_deref() != Some(tool)
    }

    fn remove(&mut self, target: &TargetId, role: Role) -> bool {
        let key = target.to_string();
        let Some(roles) = self.targets.get_mut(&key) else {
            return false;
        };
        let removed = roles.remove(role.as_str()).is_some();
        if roles.is_empty() {
            self.targets.remove(&key);
        }
        removed
    }
}

/// TOML-file store. Writes go straight to disk; failures are logged and the
/// in-memory copy stays authoritative until the next successful save.
#[derive(Debug)]
pub struct FileToolCache {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    file: ToolCacheFile,
    dirty: bool,
}

impl FileToolCache {
    /// Open the cache at `path`. A missing file is an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let file = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
                path: path.clone(),
                source: e,
            })?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        } else {
            ToolCacheFile::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(FileState { file, dirty: false }),
        })
    }

    /// Open the cache in the default config directory
    pub fn open_default() -> Result<Self, ConfigError> {
        super::paths::ensure_config_dir().map_err(ConfigError::CreateDir)?;
        let path = super::paths::tool_cache_file().ok_or_else(|| ConfigError::ReadFile {
            path: PathBuf::from("monitor_tools.toml"),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine tool cache path",
            ),
        })?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_locked(&self, state: &mut FileState) {
        let result = toml::to_string_pretty(&state.file)
            .map_err(ConfigError::Serialize)
            .and_then(|content| {
                super::write_atomic(&self.path, &content).map_err(|e| ConfigError::WriteFile {
                    path: self.path.clone(),
                    source: e,
                })
            });

        match result {
            Ok(()) => state.dirty = false,
            Err(e) => {
                state.dirty = true;
                tracing::warn!("Failed to persist tool cache: {}", e);
            }
        }
    }
}

impl ToolCacheStore for FileToolCache {
    fn read(&self, target: &TargetId, role: Role) -> Option<String> {
        self.state.lock().file.get(target, role).cloned()
    }

    fn write(&self, target: &TargetId, role: Role, tool: &str) {
        let mut state = self.state.lock();
        if state.file.set(target, role, tool) || state.dirty {
            self.save_locked(&mut state);
        }
    }

    fn forget(&self, target: &TargetId, role: Role) {
        let mut state = self.state.lock();
        if state.file.remove(target, role) || state.dirty {
            self.save_locked(&mut state);
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        if state.dirty {
            self.save_locked(&mut state);
        }
    }
}
