//! Worker assignment state tracking
//!
//! Single source of truth for the orchestrator's view of every worker:
//! its shard range, lifecycle state, heartbeat bookkeeping and restart
//! count. Entries are created once from the shard plan and recycled
//! through states; they are never removed until shutdown.
//!
//! All mutation goes through this table's synchronized operations. DashMap
//! per-entry locking serializes transitions on a given assignment, so no
//! two events can mutate the same worker concurrently.

use crate::plan::ShardRange;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle state of a worker assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting to be spawned or adopted.
    Pending,
    /// Launched/connected, shard range sent, awaiting acknowledgment.
    Starting,
    /// Acknowledged and replying to liveness probes.
    Ready,
    /// Lost: process exited, connection dropped, or heartbeats missed.
    Disconnected,
    /// Terminal: respawn disabled or retries exhausted.
    Failed,
}

impl WorkerState {
    /// States the heartbeat monitor probes.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Ready)
    }
}

/// State for a single worker assignment.
#[derive(Debug)]
struct Assignment {
    range: ShardRange,
    state: WorkerState,
    last_heartbeat: Option<Instant>,
    missed_probes: u32,
    probe_outstanding: bool,
    restart_count: u32,
    ready_at: Option<Instant>,
}

impl Assignment {
    fn new(range: ShardRange) -> Self {
        Self {
            range,
            state: WorkerState::Pending,
            last_heartbeat: None,
            missed_probes: 0,
            probe_outstanding: false,
            restart_count: 0,
            ready_at: None,
        }
    }
}

/// Shared assignment table, cheap to clone.
#[derive(Debug, Clone)]
pub struct AssignmentTable {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    workers: DashMap<u32, Assignment>,
    total_shards: u32,
}

impl AssignmentTable {
    /// Build the table from a computed shard plan.
    pub fn from_plan(ranges: &[ShardRange], total_shards: u32) -> Self {
        let workers = DashMap::new();
        for range in ranges {
            workers.insert(range.worker_id, Assignment::new(range.clone()));
        }
        Self {
            inner: Arc::new(Inner {
                workers,
                total_shards,
            }),
        }
    }

    /// Total shards across the whole fleet.
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    /// Shard range for a worker.
    pub fn range(&self, worker_id: u32) -> Option<ShardRange> {
        self.inner.workers.get(&worker_id).map(|a| a.range.clone())
    }

    /// Current state for a worker.
    pub fn state(&self, worker_id: u32) -> Option<WorkerState> {
        self.inner.workers.get(&worker_id).map(|a| a.state)
    }

    /// Move `worker_id` to `to` only if it currently is in one of `from`.
    ///
    /// Returns true when the transition happened. This is the primitive that
    /// makes "exactly once" edges possible: two racing events both asking
    /// for Ready→Disconnected resolve to a single winner under the entry
    /// lock.
    pub fn transition(&self, worker_id: u32, from: &[WorkerState], to: WorkerState) -> bool {
        match self.inner.workers.get_mut(&worker_id) {
            Some(mut entry) => {
                if !from.contains(&entry.state) {
                    return false;
                }
                entry.state = to;
                match to {
                    WorkerState::Ready => {
                        if entry.ready_at.is_none() {
                            entry.ready_at = Some(Instant::now());
                        }
                    }
                    WorkerState::Pending => {
                        // Recycled for a respawn: probe bookkeeping restarts.
                        entry.missed_probes = 0;
                        entry.probe_outstanding = false;
                        entry.last_heartbeat = None;
                    }
                    _ => {}
                }
                true
            }
            None => false,
        }
    }

    /// Record a liveness reply.
    pub fn record_heartbeat(&self, worker_id: u32) {
        if let Some(mut entry) = self.inner.workers.get_mut(&worker_id) {
            entry.last_heartbeat = Some(Instant::now());
            entry.missed_probes = 0;
            entry.probe_outstanding = false;
        }
    }

    /// Heartbeat tick for one worker: count the previous probe as missed if
    /// it went unanswered, then mark a new probe outstanding.
    ///
    /// Returns the consecutive missed count after this tick.
    pub fn probe_tick(&self, worker_id: u32) -> u32 {
        match self.inner.workers.get_mut(&worker_id) {
            Some(mut entry) => {
                if entry.probe_outstanding {
                    entry.missed_probes += 1;
                }
                entry.probe_outstanding = true;
                entry.missed_probes
            }
            None => 0,
        }
    }

    /// Restart count for a worker.
    pub fn restart_count(&self, worker_id: u32) -> u32 {
        self.inner
            .workers
            .get(&worker_id)
            .map(|a| a.restart_count)
            .unwrap_or(0)
    }

    /// Bump the restart count, returning the new value.
    pub fn increment_restart(&self, worker_id: u32) -> u32 {
        match self.inner.workers.get_mut(&worker_id) {
            Some(mut entry) => {
                entry.restart_count += 1;
                entry.restart_count
            }
            None => 0,
        }
    }

    /// Worker ids currently in `state`, ascending.
    pub fn workers_in(&self, state: WorkerState) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .inner
            .workers
            .iter()
            .filter(|e| e.state == state)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Lowest-id Pending worker, if any (remote registry binds in order).
    pub fn next_pending(&self) -> Option<u32> {
        self.workers_in(WorkerState::Pending).into_iter().next()
    }

    /// Worker ids the heartbeat monitor should probe, ascending.
    pub fn live_workers(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .inner
            .workers
            .iter()
            .filter(|e| e.state.is_live())
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Total worker count.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Count of Ready workers.
    pub fn ready_workers(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|e| e.state == WorkerState::Ready)
            .count()
    }

    /// Count of terminally Failed workers.
    pub fn failed_workers(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|e| e.state == WorkerState::Failed)
            .count()
    }

    /// True when every worker that has not terminally failed is Ready.
    ///
    /// A Failed worker is a permanent condition the respawn policy already
    /// gave up on; it must not pin readiness down for the rest of the
    /// fleet's life.
    pub fn is_healthy(&self) -> bool {
        self.ready_workers() == self.worker_count() - self.failed_workers()
    }
}
