//! Worker supervision
//!
//! Two execution modes behind one signal model: local child processes
//! ([`LocalSupervisor`]) and authenticated remote peers ([`RemoteRegistry`]).
//! Each live worker gets a link task that owns its control channel; link
//! tasks translate worker traffic into [`WorkerSignal`]s on the
//! orchestrator's event channel and accept [`LinkCommand`]s back.

mod local;
mod remote;

pub use local::LocalSupervisor;
pub use remote::RemoteRegistry;

use crate::assignment::{AssignmentTable, WorkerState};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Internal events delivered to the orchestrator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Process spawned or remote peer bound; shard range transmitted.
    Attached { worker_id: u32 },
    /// Startup acknowledged.
    Ready { worker_id: u32 },
    /// Liveness reply.
    Pong { worker_id: u32, seq: u64 },
    /// Control channel closed: process exit, connection loss, or
    /// spawn failure. Carries the observed reason.
    Closed { worker_id: u32, reason: String },
    /// No acknowledgment within the startup timeout.
    StartupTimedOut { worker_id: u32 },
    /// Heartbeat monitor declared the worker lost (already Disconnected).
    HeartbeatLost { worker_id: u32, missed: u32 },
    /// Respawn backoff elapsed; re-acquire the range.
    RespawnDue { worker_id: u32 },
}

/// Commands accepted by a worker's link task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    /// Send a liveness probe.
    Ping { seq: u64 },
    /// Deliberate shutdown. Local children get the grace period before a
    /// force kill; remote links just close.
    Shutdown,
}

/// Live control-channel handles, keyed by worker id.
///
/// Only the owning link task touches the channel itself; everyone else goes
/// through the command sender. Termination authority therefore stays with
/// the supervisor that created the link.
#[derive(Debug, Clone, Default)]
pub struct Links {
    inner: Arc<DashMap<u32, mpsc::Sender<LinkCommand>>>,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, worker_id: u32, commands: mpsc::Sender<LinkCommand>) {
        self.inner.insert(worker_id, commands);
    }

    pub fn remove(&self, worker_id: u32) {
        self.inner.remove(&worker_id);
    }

    pub fn contains(&self, worker_id: u32) -> bool {
        self.inner.contains_key(&worker_id)
    }

    /// True once every link task has deregistered itself.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Non-blocking probe send. A full or closed command queue is treated
    /// as a miss, never as something to wait on — one slow peer must not
    /// delay probing of any other.
    pub fn try_ping(&self, worker_id: u32, seq: u64) {
        if let Some(tx) = self.inner.get(&worker_id) {
            if let Err(e) = tx.try_send(LinkCommand::Ping { seq }) {
                debug!(worker_id, error = %e, "Probe not queued");
            }
        }
    }

    /// Ask one link to shut down.
    pub async fn shutdown(&self, worker_id: u32) {
        if let Some(tx) = self.inner.get(&worker_id) {
            let _ = tx.send(LinkCommand::Shutdown).await;
        }
    }

    /// Ask every link to shut down.
    pub async fn shutdown_all(&self) {
        let ids: Vec<u32> = self.inner.iter().map(|e| *e.key()).collect();
        for worker_id in ids {
            self.shutdown(worker_id).await;
        }
    }
}

/// Set once at shutdown; link tasks stop reporting closures after it.
///
/// Terminal and irreversible: there is no way to clear the flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Completes once the flag is set.
    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Arm the startup deadline for a worker that just entered Starting.
///
/// Fires a [`WorkerSignal::StartupTimedOut`] only if the same incarnation
/// is still Starting when the deadline passes. The restart count pins the
/// incarnation; a timer armed for attempt N must not kill attempt N+1.
pub(crate) fn arm_startup_timeout(
    table: AssignmentTable,
    signals: mpsc::Sender<WorkerSignal>,
    worker_id: u32,
    timeout: Duration,
) {
    let incarnation = table.restart_count(worker_id);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if table.state(worker_id) == Some(WorkerState::Starting)
            && table.restart_count(worker_id) == incarnation
        {
            let _ = signals.send(WorkerSignal::StartupTimedOut { worker_id }).await;
        }
    });
}
