//! Session gate: upstream limit query and shard-count resolution
//!
//! Queries the upstream control endpoint once per spawn sequence, resolves
//! `ShardCount::Auto` into a concrete total, and reports the session-start
//! window. The gate performs no internal retry and never sleeps — the
//! orchestrator owns the rate-limit wait.

use crate::config::{ShardCount, Token};
use crate::error::OrchestratorError;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Upstream-imposed limit on new session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    /// Total allowed session starts per window.
    pub total: u32,
    /// Starts remaining in the current window.
    pub remaining: u32,
    /// Time until the window resets.
    pub reset_after: Duration,
}

/// What the upstream endpoint reports.
#[derive(Debug, Clone)]
pub struct GatewayLimits {
    /// Upstream-recommended shard total.
    pub shards: u32,
    pub window: SessionWindow,
}

/// Success body of the upstream endpoint.
#[derive(Debug, Deserialize)]
pub struct LimitsBody {
    #[allow(dead_code)]
    pub url: Option<String>,
    pub shards: u32,
    pub session_start_limit: StartLimitBody,
}

#[derive(Debug, Deserialize)]
pub struct StartLimitBody {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds.
    pub reset_after: u64,
}

/// Client-error body of the upstream endpoint.
#[derive(Debug, Deserialize)]
pub struct UpstreamErrorBody {
    pub message: String,
    pub code: i64,
}

impl From<LimitsBody> for GatewayLimits {
    fn from(body: LimitsBody) -> Self {
        GatewayLimits {
            shards: body.shards,
            window: SessionWindow {
                total: body.session_start_limit.total,
                remaining: body.session_start_limit.remaining,
                reset_after: Duration::from_millis(body.session_start_limit.reset_after),
            },
        }
    }
}

/// Upstream query contract. The HTTP implementation lives in [`crate::http`];
/// tests substitute canned sources.
pub trait SessionSource {
    fn fetch(
        &self,
        token: &Token,
    ) -> impl std::future::Future<Output = Result<GatewayLimits, OrchestratorError>> + Send;
}

/// Resolves the shard total and exposes the rate-limit window.
#[derive(Debug, Clone, Copy)]
pub struct SessionGate {
    shard_count: ShardCount,
}

impl SessionGate {
    pub fn new(shard_count: ShardCount) -> Self {
        Self { shard_count }
    }

    /// Query upstream once. Returns the resolved shard total and the
    /// session window. A fixed shard count still fetches the window; only
    /// the recommended total is ignored.
    pub async fn fetch_limits<S: SessionSource>(
        &self,
        source: &S,
        token: &Token,
    ) -> Result<(u32, SessionWindow), OrchestratorError> {
        if token.is_empty() {
            return Err(OrchestratorError::Auth {
                context: "session-limit query requires a credential",
            });
        }

        let limits = source.fetch(token).await?;

        let total = match self.shard_count {
            ShardCount::Auto => limits.shards,
            ShardCount::Fixed(n) => n,
        };

        debug!(
            resolved_total = total,
            recommended = limits.shards,
            remaining = limits.window.remaining,
            reset_after_ms = limits.window.reset_after.as_millis() as u64,
            "Resolved session limits"
        );

        if total < 1 {
            return Err(OrchestratorError::Config(
                "upstream recommended a shard total of 0".to_string(),
            ));
        }

        Ok((total, limits.window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct CannedSource {
        limits: GatewayLimits,
        called: AtomicBool,
    }

    impl CannedSource {
        fn new(shards: u32, remaining: u32) -> Self {
            Self {
                limits: GatewayLimits {
                    shards,
                    window: SessionWindow {
                        total: 1000,
                        remaining,
                        reset_after: Duration::from_millis(5000),
                    },
                },
                called: AtomicBool::new(false),
            }
        }
    }

    impl SessionSource for CannedSource {
        async fn fetch(&self, _token: &Token) -> Result<GatewayLimits, OrchestratorError> {
            self.called.store(true, Ordering::SeqCst);
            Ok(self.limits.clone())
        }
    }

    struct FailingSource(fn() -> OrchestratorError);

    impl SessionSource for FailingSource {
        async fn fetch(&self, _token: &Token) -> Result<GatewayLimits, OrchestratorError> {
            Err((self.0)())
        }
    }

    #[tokio::test]
    async fn empty_token_fails_before_any_request() {
        let source = CannedSource::new(4, 10);
        let gate = SessionGate::new(ShardCount::Auto);
        let err = gate
            .fetch_limits(&source, &Token::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Auth { .. }));
        assert!(!source.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn auto_resolves_to_recommended_total() {
        let source = CannedSource::new(8, 1000);
        let gate = SessionGate::new(ShardCount::Auto);
        let (total, window) = gate
            .fetch_limits(&source, &Token::new("t"))
            .await
            .unwrap();
        assert_eq!(total, 8);
        assert_eq!(window.remaining, 1000);
    }

    #[tokio::test]
    async fn fixed_count_overrides_recommendation() {
        let source = CannedSource::new(8, 1000);
        let gate = SessionGate::new(ShardCount::Fixed(2));
        let (total, _) = gate
            .fetch_limits(&source, &Token::new("t"))
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn upstream_errors_pass_through_unretried() {
        let gate = SessionGate::new(ShardCount::Auto);

        let err = gate
            .fetch_limits(
                &FailingSource(|| OrchestratorError::UpstreamRejected {
                    message: "401: Unauthorized".to_string(),
                    code: 0,
                }),
                &Token::new("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UpstreamRejected { .. }));
    }

    #[test]
    fn limits_body_parses_upstream_shape() {
        let body: LimitsBody = serde_json::from_str(
            r#"{
                "url": "wss://example.invalid",
                "shards": 9,
                "session_start_limit": {"total": 1000, "remaining": 993, "reset_after": 14400000}
            }"#,
        )
        .unwrap();
        let limits: GatewayLimits = body.into();
        assert_eq!(limits.shards, 9);
        assert_eq!(limits.window.remaining, 993);
        assert_eq!(limits.window.reset_after, Duration::from_secs(14400));
    }
}
