//! Respawn policy
//!
//! Centralized decision logic for failed assignments. Restart counts live
//! in the assignment table, so local and remote modes share one source of
//! truth; this module only turns (respawn flag, count, ceiling) into a
//! decision.

use crate::config::BackoffKind;
use std::time::Duration;

/// Reason attached to a terminal failure.
pub const REASON_RESPAWN_DISABLED: &str = "respawn disabled";
pub const REASON_EXHAUSTED_RETRIES: &str = "exhausted retries";

/// What to do with a failed assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Re-enter Pending after the delay, same worker id and shard range.
    Retry { delay: Duration },
    /// Mark Failed; no further action for this worker.
    GiveUp { reason: &'static str },
}

/// Whether/when a failed assignment is retried.
#[derive(Debug, Clone, Copy)]
pub struct RespawnPolicy {
    enabled: bool,
    ceiling: u32,
    backoff: BackoffKind,
}

impl RespawnPolicy {
    pub fn new(enabled: bool, ceiling: u32, backoff: BackoffKind) -> Self {
        Self {
            enabled,
            ceiling,
            backoff,
        }
    }

    /// Decide for a worker that has already restarted `restart_count` times.
    pub fn decide(&self, restart_count: u32) -> Decision {
        if !self.enabled {
            return Decision::GiveUp {
                reason: REASON_RESPAWN_DISABLED,
            };
        }
        if restart_count >= self.ceiling {
            return Decision::GiveUp {
                reason: REASON_EXHAUSTED_RETRIES,
            };
        }
        Decision::Retry {
            delay: self.backoff.delay(restart_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_gives_up_immediately() {
        let policy = RespawnPolicy::new(false, 3, BackoffKind::Fixed(Duration::from_millis(1)));
        assert_eq!(
            policy.decide(0),
            Decision::GiveUp {
                reason: REASON_RESPAWN_DISABLED
            }
        );
    }

    #[test]
    fn ceiling_bounds_retries() {
        let policy = RespawnPolicy::new(true, 3, BackoffKind::Fixed(Duration::from_millis(10)));
        for count in 0..3 {
            assert!(matches!(policy.decide(count), Decision::Retry { .. }));
        }
        assert_eq!(
            policy.decide(3),
            Decision::GiveUp {
                reason: REASON_EXHAUSTED_RETRIES
            }
        );
        assert_eq!(
            policy.decide(10),
            Decision::GiveUp {
                reason: REASON_EXHAUSTED_RETRIES
            }
        );
    }

    #[test]
    fn retry_delay_follows_backoff() {
        let policy = RespawnPolicy::new(
            true,
            10,
            BackoffKind::Exponential {
                base: Duration::from_millis(100),
                cap: Duration::from_millis(400),
            },
        );
        assert_eq!(
            policy.decide(0),
            Decision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(2),
            Decision::Retry {
                delay: Duration::from_millis(400)
            }
        );
    }
}
