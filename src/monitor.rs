//! Heartbeat monitor
//!
//! Probes every Starting/Ready worker on a fixed interval and declares a
//! worker lost after the configured number of consecutive unanswered
//! probes. Probes are queued with `try_send`, so a slow or unreachable
//! peer never delays probing of any other peer.

use crate::assignment::{AssignmentTable, WorkerState};
use crate::supervisor::{Links, ShutdownFlag, WorkerSignal};

use metrics::counter;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Periodic liveness probing over all active workers.
pub struct HeartbeatMonitor {
    table: AssignmentTable,
    links: Links,
    signals: mpsc::Sender<WorkerSignal>,
    interval: Duration,
    miss_threshold: u32,
    shutdown: ShutdownFlag,
}

impl HeartbeatMonitor {
    pub fn new(
        table: AssignmentTable,
        links: Links,
        signals: mpsc::Sender<WorkerSignal>,
        interval: Duration,
        miss_threshold: u32,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            table,
            links,
            signals,
            interval,
            miss_threshold,
            shutdown,
        }
    }

    /// Tick until shutdown.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so workers get a
        // full interval before their first probe is scored.
        ticker.tick().await;

        let mut seq: u64 = 0;
        loop {
            ticker.tick().await;
            if self.shutdown.is_set() {
                debug!("Heartbeat monitor stopping");
                return;
            }
            seq += 1;
            self.tick(seq).await;
        }
    }

    /// One probing pass over all live workers.
    async fn tick(&self, seq: u64) {
        for worker_id in self.table.live_workers() {
            let missed = self.table.probe_tick(worker_id);
            if missed >= self.miss_threshold {
                // Guarded transition: the edge fires exactly once even if a
                // closed-channel signal races with us.
                if self.table.transition(
                    worker_id,
                    &[WorkerState::Starting, WorkerState::Ready],
                    WorkerState::Disconnected,
                ) {
                    warn!(worker_id, missed, "Worker missed heartbeat threshold");
                    counter!("orchestrator_heartbeat_missed_total").increment(1);
                    let _ = self
                        .signals
                        .send(WorkerSignal::HeartbeatLost { worker_id, missed })
                        .await;
                }
                continue;
            }
            self.links.try_ping(worker_id, seq);
        }
    }
}
