//! Application-exit teardown

use std::time::Duration;

use portal_monitor::{MonitorError, Role, ShutdownCoordinator, TargetId};

use super::fixtures::{Harness, ScriptedTransport, advance};

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_nothing_open() {
    let harness = Harness::new(ScriptedTransport::linux());
    let sessions = harness.sessions.clone();

    let targets: Vec<TargetId> = (0..3).map(|_| TargetId::new()).collect();
    for target in &targets {
        for role in Role::MONITORS {
            sessions.start_monitor(target, role).await.unwrap();
        }
        sessions.adhoc().exec(target, "uptime").await.unwrap();
    }

    // One monitor still connecting when the application exits.
    harness.transport.set_connect_delay(Duration::from_secs(3));
    let late = TargetId::new();
    let starting = tokio::spawn({
        let sessions = sessions.clone();
        async move { sessions.start_monitor(&late, Role::System).await }
    });
    advance(500).await;

    let report = ShutdownCoordinator::new(sessions.clone()).run().await;

    assert_eq!(report.targets, 4);
    assert!(starting.await.unwrap().is_ok());
    assert_eq!(harness.transport.open_connections(), 0);
    assert!(sessions.tracked_targets().is_empty());

    let connects = harness.transport.connects();
    let polls = harness.transport.executed("cat /proc/loadavg");
    advance(120_000).await;
    assert_eq!(harness.transport.connects(), connects);
    assert_eq!(harness.transport.executed("cat /proc/loadavg"), polls);
}

#[tokio::test(start_paused = true)]
async fn test_no_new_sessions_after_shutdown() {
    let harness = Harness::new(ScriptedTransport::linux());
    let sessions = harness.sessions.clone();
    ShutdownCoordinator::new(sessions.clone()).run().await;

    let target = TargetId::new();
    assert!(matches!(
        sessions.start_monitor(&target, Role::Network).await,
        Err(MonitorError::Precondition(_))
    ));
    assert!(matches!(
        sessions.adhoc().exec(&target, "uptime").await,
        Err(MonitorError::Precondition(_))
    ));
    assert_eq!(harness.transport.connects(), 0);
}
