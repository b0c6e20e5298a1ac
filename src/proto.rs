//! Control-channel wire frames
//!
//! Newline-delimited JSON spoken on every worker control channel: the
//! stdio pipe of a local child process, or the socket of a remote peer.
//! The same frames cover both modes; `Identify` only ever appears as the
//! first frame of a remote connection (the handshake).

use serde::{Deserialize, Serialize};

/// A single control-channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// Remote handshake: the peer proves possession of the shared credential.
    Identify { token: String },

    /// Orchestrator → worker: your shard range.
    Assign {
        worker_id: u32,
        shard_ids: Vec<u32>,
        total_shards: u32,
    },

    /// Worker → orchestrator: startup acknowledgment.
    Ready,

    /// Orchestrator → worker: liveness probe.
    Ping { seq: u64 },

    /// Worker → orchestrator: liveness reply.
    Pong {
        #[serde(default)]
        seq: u64,
    },

    /// Orchestrator → worker: deliberate shutdown, exit cleanly.
    Shutdown,
}

impl Frame {
    /// Serialize to a single newline-terminated line.
    pub fn encode(&self) -> String {
        let mut line = serde_json::to_string(self).expect("frame serialization is infallible");
        line.push('\n');
        line
    }

    /// Parse one line; trailing whitespace tolerated.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
