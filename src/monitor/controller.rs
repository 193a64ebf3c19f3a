//! Polling state machine for one (target, role) monitor
//!
//! Every `start()` and `stop()` bumps a generation counter. Work that was
//! begun under an older generation notices the change at its next
//! resumption point and gives up without touching state or emitting
//! anything, which is how a stop cancels a start that is still sleeping,
//! connecting or probing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::probe_log::ProbeExecutionLog;
use super::snapshot::Snapshot;
use super::tools::ToolRegistry;
use super::MonitorKind;
use crate::config::MonitorSettings;
use crate::context::HostContext;
use crate::error::MonitorError;
use crate::event::{EventSink, MonitorEvent};
use crate::pool::ConnectionPool;
use crate::role::{Role, TargetId};
use crate::transport::{exec_with_timeout, Connection};

/// Lifecycle of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Timers and limits a controller runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub start_delay: Duration,
    pub poll_interval: Duration,
    pub exec_timeout: Duration,
    pub failure_threshold: u32,
}

impl PollTiming {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            start_delay: settings.start_delay(),
            poll_interval: settings.poll_interval(),
            exec_timeout: settings.exec_timeout(),
            failure_threshold: settings.failure_threshold(),
        }
    }
}

impl PollTiming {
    /// Zero periods panic in `interval_at`, and a zero threshold would
    /// recycle the connection on every probe.
    fn clamped(self) -> Self {
        Self {
            start_delay: self.start_delay,
            poll_interval: self.poll_interval.max(Duration::from_millis(1)),
            exec_timeout: self.exec_timeout.max(Duration::from_millis(1)),
            failure_threshold: self.failure_threshold.max(1),
        }
    }
}

impl Default for PollTiming {
    fn default() -> Self {
        Self::from_settings(&MonitorSettings::default())
    }
}

struct ControllerState {
    state: MonitorState,
    generation: u64,
    consecutive_failures: u32,
    ticker: Option<JoinHandle<()>>,
}

/// How setup ended when it did not fail
enum Setup {
    Ready,
    Superseded,
}

struct ControllerInner {
    target: TargetId,
    kind: Arc<dyn MonitorKind>,
    pool: ConnectionPool,
    tools: Arc<ToolRegistry>,
    host: Arc<dyn HostContext>,
    events: EventSink,
    timing: PollTiming,
    state: Mutex<ControllerState>,
    /// Generation of the probe in flight, 0 when idle
    in_flight: AtomicU64,
}

/// Drives one monitor kind against one target
#[derive(Clone)]
pub struct MonitorController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for MonitorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MonitorController")
            .field("target", &self.inner.target)
            .field("role", &self.inner.kind.role())
            .field("state", &state.state)
            .field("generation", &state.generation)
            .finish()
    }
}

impl MonitorController {
    pub fn new(
        target: TargetId,
        kind: Arc<dyn MonitorKind>,
        pool: ConnectionPool,
        tools: Arc<ToolRegistry>,
        host: Arc<dyn HostContext>,
        events: EventSink,
        timing: PollTiming,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                target,
                kind,
                pool,
                tools,
                host,
                events,
                timing: timing.clamped(),
                state: Mutex::new(ControllerState {
                    state: MonitorState::Idle,
                    generation: 0,
                    consecutive_failures: 0,
                    ticker: None,
                }),
                in_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn target(&self) -> TargetId {
        self.inner.target
    }

    pub fn role(&self) -> Role {
        self.inner.kind.role()
    }

    pub fn state(&self) -> MonitorState {
        self.inner.state.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state.lock().consecutive_failures
    }

    /// Begin monitoring. A no-op while already starting or running.
    ///
    /// Returns once the first poll has run. Setup failures close the pooled
    /// connection, leave the monitor `Stopped` and are returned; a `stop()`
    /// that lands during setup makes this return `Ok` without starting.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let inner = &self.inner;
        let role = inner.kind.role();

        if !inner.host.is_primary_session_alive(&inner.target) {
            return Err(MonitorError::Precondition(format!(
                "no live session to {}",
                inner.target
            )));
        }

        let generation = {
            let mut state = inner.state.lock();
            if matches!(state.state, MonitorState::Starting | MonitorState::Running) {
                tracing::debug!("{} monitor for {} already active", role, inner.target);
                return Ok(());
            }
            state.generation += 1;
            state.consecutive_failures = 0;
            state.state = MonitorState::Starting;
            state.generation
        };
        inner.clear_in_flight_before(generation);
        tracing::info!("Starting {} monitor for {}", role, inner.target);

        match inner.setup(generation).await {
            Ok(Setup::Ready) => Ok(()),
            Ok(Setup::Superseded) => {
                tracing::debug!("{} monitor start for {} superseded", role, inner.target);
                Ok(())
            }
            Err(_) if !inner.is_current(generation) => {
                tracing::debug!("{} monitor start for {} superseded", role, inner.target);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{} monitor for {} failed to start: {}", role, inner.target, e);
                inner.pool.close(&inner.target).await;
                let mut state = inner.state.lock();
                if state.generation == generation {
                    state.state = MonitorState::Stopped;
                    if let Some(ticker) = state.ticker.take() {
                        ticker.abort();
                    }
                }
                Err(e)
            }
        }
    }

    /// Stop monitoring and close the pooled connection. Safe to call in
    /// any state.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }
}

impl ControllerInner {
    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn is_running(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.generation == generation && state.state == MonitorState::Running
    }

    fn clear_in_flight_before(&self, generation: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != 0 && current < generation).then_some(0)
            });
    }

    async fn setup(self: &Arc<Self>, generation: u64) -> Result<Setup, MonitorError> {
        tokio::time::sleep(self.timing.start_delay).await;
        if !self.is_current(generation) {
            return Ok(Setup::Superseded);
        }

        let connection = self.pool.ensure(&self.target).await?;
        if !self.is_current(generation) {
            self.abandon(&connection).await;
            return Ok(Setup::Superseded);
        }

        self.tools
            .resolve(self.kind.as_ref(), &self.target, connection.as_ref())
            .await?;

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return Ok(Setup::Superseded);
            }
            state.state = MonitorState::Running;
        }

        self.poll(generation).await;

        let mut state = self.state.lock();
        if state.generation != generation || state.state != MonitorState::Running {
            return Ok(Setup::Superseded);
        }
        if let Some(previous) = state.ticker.replace(self.spawn_ticker(generation)) {
            previous.abort();
        }
        tracing::debug!(
            "{} monitor for {} polling every {:?}",
            self.kind.role(),
            self.target,
            self.timing.poll_interval
        );
        Ok(Setup::Ready)
    }

    fn spawn_ticker(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        let period = self.timing.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if !controller.is_current(generation) {
                    break;
                }
                // A slow probe must not hold up the next tick.
                tokio::spawn(async move { controller.poll(generation).await });
            }
        })
    }

    async fn poll(&self, generation: u64) {
        if !self.is_running(generation) {
            return;
        }

        if !self.host.is_primary_session_alive(&self.target) {
            tracing::info!(
                "Session to {} is gone, stopping {} monitor",
                self.target,
                self.kind.role()
            );
            self.stop().await;
            return;
        }
        if !self.host.is_receiver_alive() || !self.events.is_open() {
            tracing::info!(
                "Nobody is listening, stopping {} monitor for {}",
                self.kind.role(),
                self.target
            );
            self.stop().await;
            return;
        }

        if self
            .in_flight
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(
                "{} probe for {} still running, skipping tick",
                self.kind.role(),
                self.target
            );
            return;
        }
        let _guard = InFlightGuard {
            flag: &self.in_flight,
            generation,
        };

        self.probe(generation).await;
    }

    async fn probe(&self, generation: u64) {
        let role = self.kind.role();

        let connection = match self.pool.ensure(&self.target).await {
            Ok(connection) => connection,
            Err(e) => {
                self.record_failure(generation, &e).await;
                return;
            }
        };
        if !self.is_current(generation) {
            self.abandon(&connection).await;
            return;
        }

        let tool = match self
            .tools
            .resolve(self.kind.as_ref(), &self.target, connection.as_ref())
            .await
        {
            Ok(tool) => tool,
            Err(e) => {
                self.record_failure(generation, &e).await;
                return;
            }
        };
        let Some(command) = self.kind.command(tool) else {
            tracing::error!("{} tool '{}' has no command", role, tool);
            self.tools.invalidate(&self.target, role);
            return;
        };

        let started = Instant::now();
        let result = exec_with_timeout(connection.as_ref(), &command, self.timing.exec_timeout).await;
        let log = ProbeExecutionLog::new(role, tool, &command, &result, started.elapsed());
        tracing::trace!(
            "{} probe on {} finished in {} ms (ok: {})",
            role,
            self.target,
            log.duration_ms,
            log.ok
        );

        if !self.is_current(generation) {
            return;
        }
        self.events.emit_probe(self.target, log);

        match result {
            Ok(output) if output.success() => {
                {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.consecutive_failures = 0;
                }
                match self.kind.parse(tool, &output.stdout) {
                    Ok(snapshot) => self.emit_snapshot(generation, snapshot),
                    Err(e) => tracing::warn!("{} probe on {}: {}", role, self.target, e),
                }
            }
            Ok(output) => {
                let error = MonitorError::CommandFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                };
                self.record_failure(generation, &error).await;
            }
            Err(e) => self.record_failure(generation, &e).await,
        }
    }

    /// Give back a connection acquired for a superseded generation. A
    /// `stop()` that finished while it was being established found nothing
    /// to close, so it must not stay pooled unless a newer start owns it.
    async fn abandon(&self, connection: &Arc<dyn Connection>) {
        let active = matches!(
            self.state.lock().state,
            MonitorState::Starting | MonitorState::Running
        );
        if !active {
            self.pool.release(&self.target, connection).await;
        }
    }

    async fn record_failure(&self, generation: u64, error: &MonitorError) {
        let role = self.kind.role();
        let threshold_reached = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.consecutive_failures += 1;
            tracing::warn!(
                "{} probe on {} failed ({}/{}): {}",
                role,
                self.target,
                state.consecutive_failures,
                self.timing.failure_threshold,
                error
            );
            if state.consecutive_failures >= self.timing.failure_threshold {
                state.consecutive_failures = 0;
                true
            } else {
                false
            }
        };

        if threshold_reached {
            tracing::warn!(
                "Recycling {} connection to {} after repeated failures",
                role,
                self.target
            );
            self.pool.close(&self.target).await;
            self.tools.invalidate(&self.target, role);
        } else if error.is_timeout() {
            tracing::warn!("Closing {} connection to {} after timeout", role, self.target);
            self.pool.close(&self.target).await;
        }
    }

    fn emit_snapshot(&self, generation: u64, snapshot: Snapshot) {
        let state = self.state.lock();
        if state.generation != generation || state.state != MonitorState::Running {
            return;
        }
        if !self.host.is_receiver_alive() {
            return;
        }
        self.events.emit(MonitorEvent::Snapshot {
            target: self.target,
            role: self.kind.role(),
            captured_at: Utc::now(),
            snapshot,
        });
    }

    async fn stop(&self) {
        let role = self.kind.role();
        let stopping = {
            let mut state = self.state.lock();
            match state.state {
                MonitorState::Idle | MonitorState::Stopped => None,
                previous => {
                    state.state = MonitorState::Stopping;
                    state.generation += 1;
                    if let Some(ticker) = state.ticker.take() {
                        ticker.abort();
                    }
                    Some((state.generation, previous == MonitorState::Running))
                }
            }
        };

        self.pool.close(&self.target).await;

        let Some((generation, was_running)) = stopping else {
            return;
        };
        self.clear_in_flight_before(generation);

        {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.state = MonitorState::Stopped;
            }
        }
        tracing::info!("Stopped {} monitor for {}", role, self.target);

        if was_running {
            self.events.emit(MonitorEvent::Stopped {
                target: self.target,
                role,
            });
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(ticker) = self.state.get_mut().ticker.take() {
            ticker.abort();
        }
    }
}

/// Clears the in-flight mark when a probe ends, unless a newer generation
/// already took it over.
struct InFlightGuard<'a> {
    flag: &'a AtomicU64,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .flag
            .compare_exchange(self.generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}
