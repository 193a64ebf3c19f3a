//! Monitor lifecycle through the public registry

use std::sync::Arc;
use std::sync::atomic::Ordering;

use portal_monitor::config::{MemoryToolCache, MonitorSettings, ToolCacheStore};
use portal_monitor::monitor::Snapshot;
use portal_monitor::{MonitorEvent, MonitorState, Role, TargetId};

use super::fixtures::{Harness, ScriptedTransport, advance};

#[tokio::test(start_paused = true)]
async fn test_all_monitors_report_parsed_snapshots() {
    let mut harness = Harness::new(ScriptedTransport::linux());
    let target = TargetId::new();

    for role in Role::MONITORS {
        harness
            .sessions
            .start_monitor(&target, role)
            .await
            .expect("monitor should start");
    }

    let mut seen = Vec::new();
    for event in harness.drain_events() {
        let MonitorEvent::Snapshot {
            target: from,
            snapshot,
            ..
        } = event
        else {
            continue;
        };
        assert_eq!(from, target);
        match snapshot {
            Snapshot::System(system) => {
                assert_eq!(system.memory_total_kb, 4028180);
                assert_eq!(system.memory_available_kb, Some(2611320));
                assert_eq!(system.uptime_secs, Some(86400));
                seen.push(Role::System);
            }
            Snapshot::Process(process) => {
                assert_eq!(process.total, 3);
                assert_eq!(process.processes[0].command, "nginx");
                seen.push(Role::Process);
            }
            Snapshot::Network(network) => {
                assert_eq!(network.listeners.len(), 1);
                assert_eq!(network.listeners[0].process.as_deref(), Some("nginx"));
                assert_eq!(network.connections.len(), 1);
                seen.push(Role::Network);
            }
        }
    }

    assert_eq!(seen, Role::MONITORS.to_vec());
    assert_eq!(harness.transport.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_stops_monitors_on_next_tick() {
    let mut harness = Harness::new(ScriptedTransport::linux());
    let target = TargetId::new();
    for role in Role::MONITORS {
        harness.sessions.start_monitor(&target, role).await.unwrap();
    }
    harness.drain_events();

    harness.host.session_open.store(false, Ordering::SeqCst);
    advance(5_100).await;

    for role in Role::MONITORS {
        assert_eq!(harness.sessions.monitor_state(&target, role), MonitorState::Stopped);
    }
    assert_eq!(harness.transport.open_connections(), 0);

    let stopped = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, MonitorEvent::Stopped { .. }))
        .count();
    assert_eq!(stopped, 3);
}

#[tokio::test(start_paused = true)]
async fn test_remote_drop_reconnects_on_next_poll() {
    let mut harness = Harness::new(ScriptedTransport::linux());
    let target = TargetId::new();
    harness
        .sessions
        .start_monitor(&target, Role::System)
        .await
        .unwrap();
    harness.drain_events();

    harness.transport.drop_all_remote();
    advance(5_100).await;

    assert_eq!(harness.transport.connects(), 2);
    assert_eq!(
        harness.sessions.monitor_state(&target, Role::System),
        MonitorState::Running
    );
    let snapshots = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, MonitorEvent::Snapshot { .. }))
        .count();
    assert_eq!(snapshots, 1);
}

#[tokio::test(start_paused = true)]
async fn test_detected_tool_survives_registry_restart() {
    let store = Arc::new(MemoryToolCache::new());
    let target = TargetId::new();

    let first = Harness::with_store(
        ScriptedTransport::linux(),
        MonitorSettings::default(),
        store.clone() as Arc<dyn ToolCacheStore>,
    );
    first
        .sessions
        .start_monitor(&target, Role::Network)
        .await
        .unwrap();
    assert_eq!(first.transport.executed("command -v ss"), 1);

    let second = Harness::with_store(ScriptedTransport::linux(), MonitorSettings::default(), store);
    second
        .sessions
        .start_monitor(&target, Role::Network)
        .await
        .unwrap();

    assert_eq!(second.transport.executed("command -v"), 0);
    assert_eq!(second.transport.executed("ss -H"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_emit_probe_logs() {
    let settings = MonitorSettings {
        diagnostics: true,
        ..Default::default()
    };
    let mut harness = Harness::with_settings(ScriptedTransport::linux(), settings);
    let target = TargetId::new();

    harness
        .sessions
        .start_monitor(&target, Role::Process)
        .await
        .unwrap();

    let logs: Vec<_> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            MonitorEvent::ProbeExecution { log, .. } => Some(log),
            _ => None,
        })
        .collect();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].tool, "procps");
    assert!(logs[0].ok);
    assert!(logs[0].stdout.contains("postgres"));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_role_is_refused() {
    let mut settings = MonitorSettings::default();
    settings.roles.process = false;
    let harness = Harness::with_settings(ScriptedTransport::linux(), settings);

    let result = harness
        .sessions
        .start_monitor(&TargetId::new(), Role::Process)
        .await;

    assert!(result.is_err());
    assert_eq!(harness.transport.connects(), 0);
}
