//! Ad-hoc sessions through the public registry

use portal_monitor::config::MonitorSettings;
use portal_monitor::{MonitorError, Role, Signal, TargetId};

use super::fixtures::{Harness, ScriptedTransport, advance};

#[tokio::test(start_paused = true)]
async fn test_adhoc_uses_its_own_connection() {
    let harness = Harness::new(ScriptedTransport::linux());
    let target = TargetId::new();

    harness
        .sessions
        .start_monitor(&target, Role::System)
        .await
        .unwrap();
    let output = harness
        .sessions
        .adhoc()
        .exec(&target, "cat /proc/loadavg")
        .await
        .unwrap();

    assert!(output.stdout.starts_with("0.25"));
    assert_eq!(harness.transport.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_adhoc_expires_after_idle_timeout() {
    let settings = MonitorSettings {
        adhoc_idle_timeout_ms: 1_000,
        ..Default::default()
    };
    let harness = Harness::with_settings(ScriptedTransport::linux(), settings);
    let target = TargetId::new();
    let adhoc = harness.sessions.adhoc();

    adhoc.exec(&target, "uptime").await.unwrap();
    advance(600).await;
    adhoc.exec(&target, "uptime").await.unwrap();
    advance(600).await;
    assert_eq!(harness.transport.closes(), 0);

    advance(500).await;
    assert_eq!(harness.transport.closes(), 1);
    assert_eq!(harness.transport.connects(), 1);
    assert!(harness.sessions.tracked_targets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_process_inspection_and_signalling() {
    let transport = ScriptedTransport::linux();
    transport.respond(
        "ps -o pid=",
        0,
        "  702     1 postgres  7.5  4.0 163840 Ss   10:00:00 postgres: checkpointer\n",
    );
    transport.respond("kill -HUP 702", 0, "");
    let harness = Harness::new(transport);
    let target = TargetId::new();
    let adhoc = harness.sessions.adhoc();

    let details = adhoc.process_details(&target, 702).await.unwrap().unwrap();
    assert_eq!(details.user, "postgres");
    assert_eq!(details.command_line, "postgres: checkpointer");

    adhoc.signal_process(&target, 702, Signal::Hup).await.unwrap();
    let err = adhoc
        .signal_process(&target, 703, Signal::Term)
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::CommandFailed { exit_code: 127, .. }));

    assert_eq!(harness.transport.connects(), 1);
}
