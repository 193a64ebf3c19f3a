//! Application-exit teardown of hidden sessions.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;

use crate::hidden::HiddenSessions;

/// Outcome of a shutdown run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub targets: usize,
    pub elapsed: Duration,
}

/// Drains every hidden session on exit. After `run()` returns no hidden
/// connection is open and no monitor or idle timer is armed.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    sessions: Arc<HiddenSessions>,
}

impl ShutdownCoordinator {
    pub fn new(sessions: Arc<HiddenSessions>) -> Self {
        Self { sessions }
    }

    pub async fn run(&self) -> ShutdownReport {
        let started = Instant::now();
        self.sessions.begin_shutdown();

        let targets = self.sessions.tracked_targets();
        tracing::info!("Disposing hidden sessions for {} target(s)", targets.len());

        join_all(
            targets
                .iter()
                .map(|target| self.sessions.dispose_target(target)),
        )
        .await;

        self.sessions.tool_store().flush();

        let leftover = self.sessions.tracked_targets();
        if !leftover.is_empty() {
            tracing::warn!(
                "{} target(s) still tracked after shutdown",
                leftover.len()
            );
        }

        let report = ShutdownReport {
            targets: targets.len(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Hidden sessions shut down ({} target(s) in {:?})",
            report.targets,
            report.elapsed
        );
        report
    }
}
