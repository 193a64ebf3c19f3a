pub mod paths;
pub mod settings;
pub mod tool_cache;

use std::io::Write;
use std::path::Path;

pub use settings::{MonitorSettings, RoleToggles, SshSettings};
pub use tool_cache::{FileToolCache, MemoryToolCache, ToolCacheStore};

/// Write `content` to a sibling temp file and rename it over `path`, so a
/// crash never leaves a half-written config behind.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.as_os_str().is_empty() && !parent.exists() {
        std::fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)
}
