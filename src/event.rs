//! Events delivered to the host application.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::monitor::{ProbeExecutionLog, Snapshot};
use crate::role::{Role, TargetId};

/// Events emitted by hidden monitors
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// One successful poll
    Snapshot {
        target: TargetId,
        role: Role,
        captured_at: DateTime<Utc>,
        snapshot: Snapshot,
    },
    /// Diagnostic record of a probe, emitted only when diagnostics are on
    ProbeExecution {
        target: TargetId,
        log: ProbeExecutionLog,
    },
    /// A running monitor stopped
    Stopped { target: TargetId, role: Role },
}

/// Fire-and-forget sender. A full or closed channel drops the event; there
/// is no retry.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<MonitorEvent>,
    diagnostics: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<MonitorEvent>, diagnostics: bool) -> Self {
        Self { tx, diagnostics }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn diagnostics_enabled(&self) -> bool {
        self.diagnostics
    }

    pub fn emit(&self, event: MonitorEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Monitor event channel full, dropping {}", event.kind());
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!("Monitor event receiver gone, dropping {}", event.kind());
            }
        }
    }

    pub fn emit_probe(&self, target: TargetId, log: ProbeExecutionLog) {
        if self.diagnostics {
            self.emit(MonitorEvent::ProbeExecution { target, log });
        }
    }
}

impl MonitorEvent {
    fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::Snapshot { .. } => "snapshot",
            MonitorEvent::ProbeExecution { .. } => "probe execution",
            MonitorEvent::Stopped { .. } => "stop notice",
        }
    }
}
