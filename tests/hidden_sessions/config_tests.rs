//! Settings and tool-cache files

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use portal_monitor::config::{FileToolCache, MonitorSettings, ToolCacheStore};
use portal_monitor::{Role, ShutdownCoordinator, TargetId};

use super::fixtures::{Harness, ScriptedTransport};

#[test]
fn test_settings_roundtrip_through_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("monitor.toml");

    let mut settings = MonitorSettings::default();
    settings.poll_interval_ms = 2_500;
    settings.roles.process = false;
    settings.save_to(&path).expect("save should succeed");

    let loaded = MonitorSettings::load_from(&path).expect("load should succeed");
    assert_eq!(loaded, settings);
    assert_eq!(loaded.poll_interval(), Duration::from_millis(2_500));
    assert!(!loaded.roles.is_enabled(Role::Process));
}

#[test]
fn test_malformed_settings_are_reported() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("monitor.toml");
    std::fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();

    assert!(MonitorSettings::load_from(&path).is_err());
}

#[test]
fn test_tool_cache_survives_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("monitor_tools.toml");
    let target = TargetId::new();

    {
        let cache = FileToolCache::open(&path).unwrap();
        cache.write(&target, Role::System, "procfs");
        cache.write(&target, Role::Network, "netstat");
        cache.forget(&target, Role::Network);
        cache.flush();
    }

    let reopened = FileToolCache::open(&path).unwrap();
    assert_eq!(reopened.read(&target, Role::System).as_deref(), Some("procfs"));
    assert_eq!(reopened.read(&target, Role::Network), None);
    assert_eq!(reopened.path(), path.as_path());
}

#[tokio::test(start_paused = true)]
async fn test_detected_tool_is_reused_by_next_run() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("monitor_tools.toml");

    for run in 0..2 {
        let store = Arc::new(FileToolCache::open(&path).unwrap());
        let harness = Harness::with_store(
            ScriptedTransport::linux(),
            MonitorSettings::default(),
            store,
        );
        let target = TargetId::for_destination("deploy", "web-1.example.com", 22);

        harness
            .sessions
            .start_monitor(&target, Role::Network)
            .await
            .unwrap();
        ShutdownCoordinator::new(harness.sessions.clone()).run().await;

        let checks = harness.transport.executed("command -v");
        assert_eq!(checks, if run == 0 { 1 } else { 0 }, "run {}", run);
        assert_eq!(harness.transport.executed("ss -H"), 1);
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.matches("network = ").count(), 1);
}
