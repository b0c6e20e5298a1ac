//! Orchestrator: top-level owner of the worker fleet
//!
//! Sequences the session gate, the shard plan and the execution backend,
//! then runs the event loop that serializes every assignment state change:
//! startup acknowledgments, liveness replies, channel closures, startup
//! timeouts, heartbeat losses and respawn deadlines all arrive as
//! [`WorkerSignal`]s on one channel.

use crate::assignment::{AssignmentTable, WorkerState};
use crate::config::{Config, Mode, Token};
use crate::error::OrchestratorError;
use crate::events::{WorkerEvent, WorkerEventKind};
use crate::gate::{SessionGate, SessionSource, SessionWindow};
use crate::monitor::HeartbeatMonitor;
use crate::plan::{plan, ShardRange};
use crate::respawn::{Decision, RespawnPolicy};
use crate::supervisor::{
    Links, LocalSupervisor, RemoteRegistry, ShutdownFlag, WorkerSignal,
};

use metrics::{counter, gauge};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Capacity of the internal signal channel.
const SIGNAL_BUFFER: usize = 256;

/// Capacity of the outward event stream.
const EVENT_BUFFER: usize = 256;

enum Backend {
    Local(LocalSupervisor),
    Remote(RemoteRegistry),
}

/// External handle: status queries, event subscription, shutdown.
#[derive(Clone)]
pub struct OrchestratorHandle {
    table: AssignmentTable,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: ShutdownFlag,
}

impl OrchestratorHandle {
    pub fn table(&self) -> &AssignmentTable {
        &self.table
    }

    /// Subscribe to the outward worker event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Request shutdown. Terminal and irreversible: the monitor stops, all
    /// links are asked to close (local children get the grace period before
    /// a force kill) and no assignment re-enters Pending afterwards.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_set()
    }
}

/// Top-level owner of all worker assignment state.
pub struct Orchestrator {
    config: Config,
    table: AssignmentTable,
    ranges: Vec<ShardRange>,
    window: SessionWindow,
    links: Links,
    policy: RespawnPolicy,
    backend: Backend,
    signals_tx: mpsc::Sender<WorkerSignal>,
    signals_rx: mpsc::Receiver<WorkerSignal>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: ShutdownFlag,
}

impl Orchestrator {
    /// Query the session gate, compute the shard plan (exactly once) and
    /// build the fleet state. Startup-level failures (config, auth,
    /// upstream) surface here; nothing has been spawned yet.
    pub async fn boot<S: SessionSource>(
        config: Config,
        token: Token,
        source: &S,
    ) -> Result<Self, OrchestratorError> {
        let gate = SessionGate::new(config.shard_count);
        let (total, window) = gate.fetch_limits(source, &token).await?;

        let ranges = plan(total, config.shards_per_worker)?;
        let table = AssignmentTable::from_plan(&ranges, total);

        info!(
            total_shards = total,
            workers = ranges.len(),
            guilds_per_shard = config.guilds_per_shard,
            session_remaining = window.remaining,
            "Shard plan computed"
        );

        let links = Links::new();
        let shutdown = ShutdownFlag::new();
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let policy = RespawnPolicy::new(config.respawn, config.respawn_ceiling, config.backoff);

        let backend = match &config.mode {
            Mode::Local { command, args } => Backend::Local(LocalSupervisor::new(
                command.clone(),
                args.clone(),
                table.clone(),
                links.clone(),
                signals_tx.clone(),
                config.timeout,
                shutdown.clone(),
            )),
            Mode::Remote { listen, park } => Backend::Remote(RemoteRegistry::new(
                listen.clone(),
                *park,
                token,
                table.clone(),
                links.clone(),
                signals_tx.clone(),
                config.timeout,
                config.handshake_timeout,
                shutdown.clone(),
            )),
        };

        Ok(Self {
            config,
            table,
            ranges,
            window,
            links,
            policy,
            backend,
            signals_tx,
            signals_rx,
            events,
            shutdown,
        })
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            table: self.table.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Enforce the rate-limit wait, realize the plan, and run the event
    /// loop until shutdown.
    pub async fn run(mut self) -> Result<(), OrchestratorError> {
        // The only strictly sequential gate before the first wave: with no
        // session starts remaining, nothing may leave Pending until the
        // window resets.
        if self.window.remaining == 0 {
            warn!(
                reset_after_ms = self.window.reset_after.as_millis() as u64,
                "Session window exhausted, waiting for reset"
            );
            tokio::time::sleep(self.window.reset_after).await;
        }

        match &self.backend {
            Backend::Local(supervisor) => {
                supervisor.launch_pending(&self.ranges);
            }
            Backend::Remote(registry) => {
                registry.bind().await?;
            }
        }

        gauge!("orchestrator_workers_total").set(self.table.worker_count() as f64);

        let monitor = HeartbeatMonitor::new(
            self.table.clone(),
            self.links.clone(),
            self.signals_tx.clone(),
            self.config.timeout,
            self.config.heartbeat_miss_threshold,
            self.shutdown.clone(),
        );
        tokio::spawn(monitor.run());

        loop {
            let signal = tokio::select! {
                signal = self.signals_rx.recv() => signal,
                _ = self.shutdown.wait() => break,
            };
            match signal {
                Some(signal) => self.handle_signal(signal).await,
                None => break,
            }
        }

        info!("Orchestrator shutting down");
        self.shutdown.trigger();
        self.links.shutdown_all().await;

        // Do not return until the link tasks have drained: each one delivers
        // the Shutdown frame and, for local children, waits the grace period
        // before a force kill. Returning earlier would let the process exit
        // and hard-kill workers mid-reap.
        let deadline = tokio::time::Instant::now() + self.config.timeout * 2;
        while !self.links.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn handle_signal(&self, signal: WorkerSignal) {
        if self.shutdown.is_set() {
            return;
        }
        match signal {
            WorkerSignal::Attached { worker_id } => {
                self.emit(worker_id, WorkerEventKind::Connected);
            }
            WorkerSignal::Ready { worker_id } => {
                if self
                    .table
                    .transition(worker_id, &[WorkerState::Starting], WorkerState::Ready)
                {
                    self.table.record_heartbeat(worker_id);
                    record_heartbeat_gauge(worker_id);
                    info!(worker_id, "Worker ready");
                    self.emit(worker_id, WorkerEventKind::Ready);
                }
                gauge!("orchestrator_workers_ready").set(self.table.ready_workers() as f64);
            }
            WorkerSignal::Pong { worker_id, .. } => {
                self.table.record_heartbeat(worker_id);
                record_heartbeat_gauge(worker_id);
                // A remote worker's first liveness reply doubles as its
                // startup acknowledgment.
                if self
                    .table
                    .transition(worker_id, &[WorkerState::Starting], WorkerState::Ready)
                {
                    info!(worker_id, "Worker ready (first liveness reply)");
                    self.emit(worker_id, WorkerEventKind::Ready);
                    gauge!("orchestrator_workers_ready").set(self.table.ready_workers() as f64);
                }
            }
            WorkerSignal::Closed { worker_id, reason } => {
                if self.table.transition(
                    worker_id,
                    &[WorkerState::Starting, WorkerState::Ready],
                    WorkerState::Disconnected,
                ) {
                    warn!(worker_id, reason = %reason, "Worker disconnected");
                    self.emit(
                        worker_id,
                        WorkerEventKind::Disconnected {
                            reason: reason.clone(),
                        },
                    );
                    gauge!("orchestrator_workers_ready").set(self.table.ready_workers() as f64);
                    self.handle_failure(worker_id).await;
                }
            }
            WorkerSignal::StartupTimedOut { worker_id } => {
                if self.table.transition(
                    worker_id,
                    &[WorkerState::Starting],
                    WorkerState::Disconnected,
                ) {
                    warn!(worker_id, "Worker startup timed out");
                    self.emit(
                        worker_id,
                        WorkerEventKind::Disconnected {
                            reason: "startup timeout".to_string(),
                        },
                    );
                    self.links.shutdown(worker_id).await;
                    self.handle_failure(worker_id).await;
                }
            }
            WorkerSignal::HeartbeatLost { worker_id, missed } => {
                // The monitor already performed the guarded transition.
                self.emit(
                    worker_id,
                    WorkerEventKind::Disconnected {
                        reason: format!("missed {missed} heartbeat probe(s)"),
                    },
                );
                gauge!("orchestrator_workers_ready").set(self.table.ready_workers() as f64);
                self.links.shutdown(worker_id).await;
                self.handle_failure(worker_id).await;
            }
            WorkerSignal::RespawnDue { worker_id } => {
                if self.table.state(worker_id) != Some(WorkerState::Pending) {
                    return;
                }
                match &self.backend {
                    Backend::Local(supervisor) => supervisor.launch(worker_id).await,
                    Backend::Remote(registry) => registry.adopt(worker_id).await,
                }
            }
        }
    }

    /// Route a Disconnected worker through the respawn policy.
    async fn handle_failure(&self, worker_id: u32) {
        match self.policy.decide(self.table.restart_count(worker_id)) {
            Decision::GiveUp { reason } => {
                if self
                    .table
                    .transition(worker_id, &[WorkerState::Disconnected], WorkerState::Failed)
                {
                    error!(worker_id, reason, "Worker failed terminally");
                    counter!("orchestrator_workers_failed_total").increment(1);
                    self.emit(
                        worker_id,
                        WorkerEventKind::Failed {
                            reason: reason.to_string(),
                        },
                    );
                }
            }
            Decision::Retry { delay } => {
                let attempt = self.table.increment_restart(worker_id);
                if !self
                    .table
                    .transition(worker_id, &[WorkerState::Disconnected], WorkerState::Pending)
                {
                    return;
                }
                info!(
                    worker_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Respawning worker"
                );
                counter!("orchestrator_respawns_total").increment(1);
                self.emit(worker_id, WorkerEventKind::Respawning { attempt });

                let signals = self.signals_tx.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !shutdown.is_set() {
                        let _ = signals.send(WorkerSignal::RespawnDue { worker_id }).await;
                    }
                });
            }
        }
    }

    fn emit(&self, worker_id: u32, kind: WorkerEventKind) {
        let (start, end) = self
            .table
            .range(worker_id)
            .map(|r| (r.start, r.end))
            .unwrap_or((0, 0));
        // No subscribers is fine; the stream is best-effort.
        let _ = self.events.send(WorkerEvent::new(worker_id, start, end, kind));
    }
}

/// Stamp the per-worker liveness gauge with the wall-clock time of the
/// latest heartbeat, in epoch milliseconds.
fn record_heartbeat_gauge(worker_id: u32) {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);
    gauge!("orchestrator_last_heartbeat_ms", "worker_id" => worker_id.to_string()).set(now_ms);
}
