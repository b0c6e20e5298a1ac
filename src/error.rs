//! Domain error types for the shard orchestrator.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, OrchestratorError>.
//!
//! Worker failures (crash, startup timeout, heartbeat loss) are deliberately
//! NOT variants here: they are routed through the respawn policy and only
//! surface as terminal worker events, never as an unhandled fault.

use thiserror::Error;

/// Orchestrator domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration error (environment variable missing or invalid,
    /// shard/worker counts out of range). Fatal at startup, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or rejected credential, for the upstream query or a
    /// remote-worker handshake.
    #[error("authentication failed: {context}")]
    Auth { context: &'static str },

    /// Upstream refused the session-limit query with a structured error body
    /// (status < 500).
    #[error("upstream rejected session-limit query (code {code}): {message}")]
    UpstreamRejected { message: String, code: i64 },

    /// Upstream could not be reached, or answered with a server error.
    #[error("upstream session-limit endpoint unavailable")]
    UpstreamUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Shard plan inputs out of range (total or per-worker count < 1).
    #[error("invalid shard plan: total={total}, per_worker={per_worker}")]
    InvalidPlan { total: u32, per_worker: u32 },

    /// A remote connection failed its handshake (malformed frame, timeout,
    /// or credential mismatch). Fatal for that one connection only.
    #[error("handshake rejected: {reason}")]
    Handshake { reason: &'static str },

    /// I/O failure binding the listener or spawning a worker process.
    #[error("I/O error during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `orchestrator_errors_total`,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth { .. } => "auth",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::InvalidPlan { .. } => "invalid_plan",
            Self::Handshake { .. } => "handshake",
            Self::Io { .. } => "io",
        }
    }
}
