//! Outward event stream
//!
//! Subscribers observe worker lifecycle changes over a broadcast channel
//! instead of registering listeners on the transport server. Payloads carry
//! uuid event ids and millisecond timestamps so they can be forwarded to a
//! broker verbatim.

use serde::Serialize;
use uuid::Uuid;

/// What happened to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEventKind {
    /// Process spawned or remote peer authenticated and bound.
    Connected,
    /// Startup acknowledged; the worker owns its shard range.
    Ready,
    /// Crash, connection loss, startup timeout or heartbeat loss.
    Disconnected { reason: String },
    /// The respawn policy is bringing the worker back.
    Respawning { attempt: u32 },
    /// Terminal: respawn disabled or retries exhausted.
    Failed { reason: String },
}

/// One entry on the orchestrator's outward event stream.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEvent {
    pub event_id: String,
    pub worker_id: u32,
    /// First and one-past-last shard id of the worker's range.
    pub shard_start: u32,
    pub shard_end: u32,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: WorkerEventKind,
}

impl WorkerEvent {
    pub fn new(worker_id: u32, shard_start: u32, shard_end: u32, kind: WorkerEventKind) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            event_id: Uuid::new_v4().to_string(),
            worker_id,
            shard_start,
            shard_end,
            timestamp,
            kind,
        }
    }
}
