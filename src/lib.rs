//! shardkeeper - orchestrator for a sharded real-time connection fleet
//!
//! Coordinates stateful shard workers running either as local child
//! processes or as remote peers connecting over the network:
//! - Queries the upstream session-limit endpoint and enforces its window
//! - Allocates shard ranges deterministically across workers
//! - Supervises local processes / authenticates remote connections
//! - Detects failures via heartbeats and applies a bounded respawn policy

pub mod assignment;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod health;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod proto;
pub mod respawn;
pub mod supervisor;

pub use assignment::{AssignmentTable, WorkerState};
pub use config::{BackoffKind, Config, ListenTarget, Mode, ParkPolicy, ShardCount, Token};
pub use error::OrchestratorError;
pub use events::{WorkerEvent, WorkerEventKind};
pub use gate::{GatewayLimits, SessionGate, SessionSource, SessionWindow};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use plan::{plan, ShardRange};
