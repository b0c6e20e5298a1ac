//! Orchestrator configuration module
//!
//! Handles loading configuration from environment variables and holds the
//! shared-credential secret. The credential lives in [`Token`], a redacting
//! holder that is passed by reference into the session gate and the remote
//! handshake check only — it is never serialized with orchestrator state.

use crate::error::OrchestratorError;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Target shard total: either fixed up front or resolved from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardCount {
    /// Ask the upstream session-limit endpoint for the recommended count.
    Auto,
    /// Use exactly this many shards.
    Fixed(u32),
}

/// Where the remote registry accepts worker connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp { addr: String, port: u16 },
    Unix(PathBuf),
}

/// Backoff applied between respawn attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed(Duration),
    /// base * 2^attempt, capped.
    Exponential { base: Duration, cap: Duration },
}

impl BackoffKind {
    /// Delay before restart attempt `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffKind::Fixed(d) => d,
            BackoffKind::Exponential { base, cap } => {
                let factor = 2u32.saturating_pow(attempt.min(16));
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// What the remote registry does with an authenticated peer when no Pending
/// assignment exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkPolicy {
    /// Keep the connection idle and adopt it when an assignment re-enters
    /// Pending.
    Park,
    /// Close it immediately.
    Close,
}

/// Execution mode for the worker fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Workers are child processes of the orchestrator.
    Local { command: String, args: Vec<String> },
    /// Workers connect over the network and authenticate via handshake.
    Remote {
        listen: ListenTarget,
        park: ParkPolicy,
    },
}

/// Shared credential for the upstream query and the remote handshake.
///
/// Redacted in Debug/Display output; compare with [`Token::matches`].
#[derive(Clone)]
pub struct Token(String);

impl Token {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw secret, for building the upstream authorization header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Credential check for the remote handshake.
    pub fn matches(&self, presented: &str) -> bool {
        !self.0.is_empty() && self.0 == presented
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Target shard total across the whole fleet.
    pub shard_count: ShardCount,

    /// Shards per worker; None means a single worker takes everything.
    pub shards_per_worker: Option<u32>,

    /// Informational sizing hint only; never affects the plan.
    pub guilds_per_shard: Option<u32>,

    /// Whether failed workers are restarted.
    pub respawn: bool,

    /// Maximum restarts per worker before it is marked Failed.
    pub respawn_ceiling: u32,

    /// Startup acknowledgment deadline; also the heartbeat interval.
    pub timeout: Duration,

    /// Consecutive missed heartbeat replies before a worker is Disconnected.
    pub heartbeat_miss_threshold: u32,

    /// Deadline for a remote peer to present its handshake frame.
    pub handshake_timeout: Duration,

    /// Delay between respawn attempts.
    pub backoff: BackoffKind,

    /// Local child processes or remote peers.
    pub mode: Mode,

    /// Upstream session-limit endpoint URL.
    pub upstream_url: String,

    /// Health/metrics HTTP port.
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration and credential from environment variables.
    pub fn from_env() -> Result<(Self, Token), OrchestratorError> {
        dotenvy::dotenv().ok();

        let token = Token::new(
            env::var("SHARD_TOKEN")
                .map_err(|_| OrchestratorError::Config("SHARD_TOKEN must be set".to_string()))?,
        );

        let shard_count = match env::var("SHARD_COUNT")
            .unwrap_or_else(|_| "auto".to_string())
            .as_str()
        {
            "auto" => ShardCount::Auto,
            n => ShardCount::Fixed(parse_count("SHARD_COUNT", n)?),
        };

        let shards_per_worker = match env::var("SHARDS_PER_WORKER") {
            Ok(v) => Some(parse_count("SHARDS_PER_WORKER", &v)?),
            Err(_) => None,
        };

        let guilds_per_shard = match env::var("GUILDS_PER_SHARD") {
            Ok(v) => Some(parse_count("GUILDS_PER_SHARD", &v)?),
            Err(_) => None,
        };

        let respawn = parse_bool("RESPAWN", true)?;

        let respawn_ceiling = env::var("RESPAWN_CEILING")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|e| {
                OrchestratorError::Config(format!("RESPAWN_CEILING must be a valid number: {e}"))
            })?;

        let timeout = parse_millis("STARTUP_TIMEOUT_MS", 30_000)?;

        let heartbeat_miss_threshold = env::var("HEARTBEAT_MISS_THRESHOLD")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|e| {
                OrchestratorError::Config(format!(
                    "HEARTBEAT_MISS_THRESHOLD must be a valid number: {e}"
                ))
            })
            .and_then(|n: u32| {
                if n >= 1 {
                    Ok(n)
                } else {
                    Err(OrchestratorError::Config(
                        "HEARTBEAT_MISS_THRESHOLD must be >= 1".to_string(),
                    ))
                }
            })?;

        let handshake_timeout = parse_millis("HANDSHAKE_TIMEOUT_MS", timeout.as_millis() as u64)?;

        let backoff = {
            let base = parse_millis("BACKOFF_BASE_MS", 500)?;
            match env::var("BACKOFF")
                .unwrap_or_else(|_| "exponential".to_string())
                .as_str()
            {
                "fixed" => BackoffKind::Fixed(base),
                "exponential" => BackoffKind::Exponential {
                    base,
                    cap: parse_millis("BACKOFF_CAP_MS", 30_000)?,
                },
                other => {
                    return Err(OrchestratorError::Config(format!(
                        "BACKOFF must be 'fixed' or 'exponential', got '{other}'"
                    )))
                }
            }
        };

        let mode = match env::var("MODE").unwrap_or_else(|_| "local".to_string()).as_str() {
            "local" => {
                let command = env::var("WORKER_COMMAND").map_err(|_| {
                    OrchestratorError::Config(
                        "WORKER_COMMAND must be set in local mode".to_string(),
                    )
                })?;
                let args = env::var("WORKER_ARGS")
                    .map(|v| v.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                Mode::Local { command, args }
            }
            "remote" => {
                let listen = if let Ok(path) = env::var("LISTEN_SOCKET") {
                    ListenTarget::Unix(PathBuf::from(path))
                } else {
                    let addr =
                        env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());
                    let port = env::var("LISTEN_PORT")
                        .map_err(|_| {
                            OrchestratorError::Config(
                                "LISTEN_PORT or LISTEN_SOCKET must be set in remote mode"
                                    .to_string(),
                            )
                        })?
                        .parse()
                        .map_err(|e| {
                            OrchestratorError::Config(format!(
                                "LISTEN_PORT must be a valid port number: {e}"
                            ))
                        })?;
                    ListenTarget::Tcp { addr, port }
                };
                let park = match env::var("PARK_POLICY")
                    .unwrap_or_else(|_| "park".to_string())
                    .as_str()
                {
                    "park" => ParkPolicy::Park,
                    "close" => ParkPolicy::Close,
                    other => {
                        return Err(OrchestratorError::Config(format!(
                            "PARK_POLICY must be 'park' or 'close', got '{other}'"
                        )))
                    }
                };
                Mode::Remote { listen, park }
            }
            other => {
                return Err(OrchestratorError::Config(format!(
                    "MODE must be 'local' or 'remote', got '{other}'"
                )))
            }
        };

        let upstream_url = env::var("UPSTREAM_URL").map_err(|_| {
            OrchestratorError::Config("UPSTREAM_URL must be set".to_string())
        })?;

        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| {
                OrchestratorError::Config(format!("HTTP_PORT must be a valid port number: {e}"))
            })?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok((
            Self {
                shard_count,
                shards_per_worker,
                guilds_per_shard,
                respawn,
                respawn_ceiling,
                timeout,
                heartbeat_miss_threshold,
                handshake_timeout,
                backoff,
                mode,
                upstream_url,
                http_port,
                log_level,
            },
            token,
        ))
    }
}

fn parse_count(name: &str, raw: &str) -> Result<u32, OrchestratorError> {
    let n: u32 = raw
        .parse()
        .map_err(|e| OrchestratorError::Config(format!("{name} must be a valid number: {e}")))?;
    if n < 1 {
        return Err(OrchestratorError::Config(format!("{name} must be >= 1")));
    }
    Ok(n)
}

fn parse_bool(name: &str, default: bool) -> Result<bool, OrchestratorError> {
    match env::var(name) {
        Ok(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(OrchestratorError::Config(format!(
                "{name} must be true or false, got '{other}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn parse_millis(name: &str, default: u64) -> Result<Duration, OrchestratorError> {
    let ms: u64 = env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| OrchestratorError::Config(format!("{name} must be milliseconds: {e}")))?;
    Ok(Duration::from_millis(ms))
}
