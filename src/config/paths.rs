//! Where monitor files live on disk

use directories::{BaseDirs, ProjectDirs};
use std::io;
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "monitor.toml";
const TOOL_CACHE_FILE: &str = "monitor_tools.toml";
const LOG_DIR_ENV: &str = "PORTAL_MONITOR_LOG_DIR";

/// Identity files tried, in order, when a key path is not given.
const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Portal's configuration directory, shared with the client.
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "portal", "portal").map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn settings_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(SETTINGS_FILE))
}

pub fn tool_cache_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(TOOL_CACHE_FILE))
}

pub fn ensure_config_dir() -> io::Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| not_found("config directory"))?;
    create_private_dir(&dir)?;
    Ok(dir)
}

/// `PORTAL_MONITOR_LOG_DIR` when set; blank disables file logging.
fn log_dir_override() -> Option<Option<PathBuf>> {
    let raw = std::env::var(LOG_DIR_ENV).ok()?;
    let trimmed = raw.trim();
    Some((!trimmed.is_empty()).then(|| PathBuf::from(trimmed)))
}

pub fn log_dir() -> Option<PathBuf> {
    match log_dir_override() {
        Some(dir) => dir,
        None => config_dir().map(|dir| dir.join("logs")),
    }
}

pub fn ensure_log_dir() -> io::Result<PathBuf> {
    if log_dir_override().is_none() {
        ensure_config_dir()?;
    }
    let dir = log_dir().ok_or_else(|| not_found("log directory"))?;
    create_private_dir(&dir)?;
    Ok(dir)
}

/// Create `dir` and its parents, owner-only on Unix. Existing directories
/// keep whatever mode they have.
fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn not_found(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("Could not determine {}", what))
}

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

pub fn default_identity_files() -> Vec<PathBuf> {
    let Some(ssh_dir) = home_dir().map(|home| home.join(".ssh")) else {
        return Vec::new();
    };
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}
