//! Local-mode orchestration tests
//!
//! Drive the orchestrator end to end against real child processes
//! (shell one-liners speaking the control protocol over stdio) and a
//! canned session source.

use shardkeeper::config::{BackoffKind, Config, Mode, ShardCount, Token};
use shardkeeper::error::OrchestratorError;
use shardkeeper::events::{WorkerEvent, WorkerEventKind};
use shardkeeper::gate::{GatewayLimits, SessionSource, SessionWindow};
use shardkeeper::orchestrator::Orchestrator;
use shardkeeper::respawn::{REASON_EXHAUSTED_RETRIES, REASON_RESPAWN_DISABLED};
use shardkeeper::WorkerState;
use std::time::Duration;
use tokio::sync::broadcast;

struct CannedSource {
    shards: u32,
    remaining: u32,
    reset_after: Duration,
}

impl SessionSource for CannedSource {
    async fn fetch(&self, _token: &Token) -> Result<GatewayLimits, OrchestratorError> {
        Ok(GatewayLimits {
            shards: self.shards,
            window: SessionWindow {
                total: 1000,
                remaining: self.remaining,
                reset_after: self.reset_after,
            },
        })
    }
}

fn local_config(command: &str, args: &[&str], respawn: bool, ceiling: u32) -> Config {
    Config {
        shard_count: ShardCount::Auto,
        shards_per_worker: None,
        guilds_per_shard: None,
        respawn,
        respawn_ceiling: ceiling,
        timeout: Duration::from_millis(300),
        heartbeat_miss_threshold: 1,
        handshake_timeout: Duration::from_millis(300),
        backoff: BackoffKind::Fixed(Duration::from_millis(25)),
        mode: Mode::Local {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        },
        upstream_url: "http://unused.invalid".to_string(),
        http_port: 0,
        log_level: "debug".to_string(),
    }
}

/// Wait for the first event matching `pred`, collecting everything seen.
async fn await_event(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    seen: &mut Vec<WorkerEvent>,
    pred: impl Fn(&WorkerEventKind) -> bool,
) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    seen.push(event.clone());
                    if pred(&event.kind) {
                        return event;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event was not observed")
}

/// Shell worker that acknowledges startup and answers every probe.
const RESPONSIVE_WORKER: &str =
    r#"echo '{"op":"ready"}'; while read line; do echo '{"op":"pong"}'; done"#;

#[tokio::test]
async fn responsive_worker_reaches_ready_and_shuts_down() {
    let source = CannedSource {
        shards: 2,
        remaining: 100,
        reset_after: Duration::from_secs(1),
    };
    let config = local_config("/bin/sh", &["-c", RESPONSIVE_WORKER], false, 0);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(orchestrator.run());

    let mut seen = Vec::new();
    await_event(&mut events, &mut seen, |k| {
        matches!(k, WorkerEventKind::Ready)
    })
    .await;
    assert_eq!(handle.table().state(0), Some(WorkerState::Ready));

    handle.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run did not stop after shutdown")
        .unwrap();
    assert!(result.is_ok());
    assert!(handle.is_shutting_down());
}

#[tokio::test]
async fn crashing_worker_exhausts_retries() {
    let source = CannedSource {
        shards: 1,
        remaining: 100,
        reset_after: Duration::from_secs(1),
    };
    let config = local_config("/bin/sh", &["-c", "exit 7"], true, 3);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();
    tokio::spawn(orchestrator.run());

    let mut seen = Vec::new();
    let failed = await_event(&mut events, &mut seen, |k| {
        matches!(k, WorkerEventKind::Failed { .. })
    })
    .await;

    assert_eq!(
        failed.kind,
        WorkerEventKind::Failed {
            reason: REASON_EXHAUSTED_RETRIES.to_string()
        }
    );

    // Exactly ceiling restart attempts, each announced once.
    let respawns: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e.kind {
            WorkerEventKind::Respawning { attempt } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(respawns, vec![1, 2, 3]);
    assert_eq!(handle.table().restart_count(0), 3);
    assert_eq!(handle.table().state(0), Some(WorkerState::Failed));
    handle.shutdown();
}

#[tokio::test]
async fn respawn_disabled_makes_first_failure_terminal() {
    let source = CannedSource {
        shards: 1,
        remaining: 100,
        reset_after: Duration::from_secs(1),
    };
    let config = local_config("/bin/sh", &["-c", "exit 1"], false, 3);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();
    tokio::spawn(orchestrator.run());

    let mut seen = Vec::new();
    let failed = await_event(&mut events, &mut seen, |k| {
        matches!(k, WorkerEventKind::Failed { .. })
    })
    .await;
    assert_eq!(
        failed.kind,
        WorkerEventKind::Failed {
            reason: REASON_RESPAWN_DISABLED.to_string()
        }
    );
    assert!(!seen
        .iter()
        .any(|e| matches!(e.kind, WorkerEventKind::Respawning { .. })));

    // A Disconnected assignment never re-enters Pending with respawn off.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.table().state(0), Some(WorkerState::Failed));
    assert_eq!(handle.table().restart_count(0), 0);
    handle.shutdown();
}

#[tokio::test]
async fn silent_worker_hits_startup_timeout() {
    let source = CannedSource {
        shards: 1,
        remaining: 100,
        reset_after: Duration::from_secs(1),
    };
    // cat echoes our frames back but never acknowledges startup.
    let config = local_config("/bin/cat", &[], false, 0);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();
    tokio::spawn(orchestrator.run());

    let mut seen = Vec::new();
    await_event(&mut events, &mut seen, |k| {
        matches!(k, WorkerEventKind::Failed { .. })
    })
    .await;

    let disconnect_reasons: Vec<&str> = seen
        .iter()
        .filter_map(|e| match &e.kind {
            WorkerEventKind::Disconnected { reason } => Some(reason.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(disconnect_reasons, vec!["startup timeout"]);
    handle.shutdown();
}

#[tokio::test]
async fn ready_worker_that_stops_replying_is_disconnected_exactly_once() {
    let source = CannedSource {
        shards: 1,
        remaining: 100,
        reset_after: Duration::from_secs(1),
    };
    let worker = r#"echo '{"op":"ready"}'; exec sleep 60"#;
    let config = local_config("/bin/sh", &["-c", worker], false, 0);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();
    tokio::spawn(orchestrator.run());

    let mut seen = Vec::new();
    await_event(&mut events, &mut seen, |k| {
        matches!(k, WorkerEventKind::Failed { .. })
    })
    .await;

    let disconnects: Vec<&WorkerEvent> = seen
        .iter()
        .filter(|e| matches!(e.kind, WorkerEventKind::Disconnected { .. }))
        .collect();
    assert_eq!(disconnects.len(), 1, "one heartbeat loss, one transition");
    assert!(matches!(
        &disconnects[0].kind,
        WorkerEventKind::Disconnected { reason } if reason.contains("heartbeat")
    ));
    assert!(seen
        .iter()
        .any(|e| matches!(e.kind, WorkerEventKind::Ready)));
    handle.shutdown();
}

#[tokio::test]
async fn shutdown_delivers_the_shutdown_frame_before_run_returns() {
    // The worker records receiving the shutdown frame, then exits cleanly.
    let sentinel =
        std::env::temp_dir().join(format!("shardkeeper-test-{}", uuid::Uuid::new_v4()));
    let script = format!(
        r#"echo '{{"op":"ready"}}'; while read line; do case "$line" in *shutdown*) touch '{}'; exit 0 ;; *) echo '{{"op":"pong"}}' ;; esac; done"#,
        sentinel.display()
    );
    let source = CannedSource {
        shards: 1,
        remaining: 100,
        reset_after: Duration::from_secs(1),
    };
    let config = local_config("/bin/sh", &["-c", script.as_str()], false, 0);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(orchestrator.run());

    let mut seen = Vec::new();
    await_event(&mut events, &mut seen, |k| {
        matches!(k, WorkerEventKind::Ready)
    })
    .await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run did not drain after shutdown")
        .unwrap()
        .unwrap();

    // run() only returns after the link task delivered the frame and
    // reaped the worker.
    assert!(
        sentinel.exists(),
        "worker never received the shutdown frame"
    );
    let _ = std::fs::remove_file(&sentinel);
}

#[tokio::test(start_paused = true)]
async fn exhausted_session_window_delays_the_first_wave() {
    let reset_after = Duration::from_secs(120);
    let source = CannedSource {
        shards: 2,
        remaining: 0,
        reset_after,
    };
    let mut config = local_config("/bin/cat", &[], false, 0);
    config.shards_per_worker = Some(1);

    let orchestrator = Orchestrator::boot(config, Token::new("t"), &source)
        .await
        .unwrap();
    let handle = orchestrator.handle();
    let mut events = handle.subscribe();

    // Nothing has been launched yet: the whole plan is Pending.
    assert_eq!(handle.table().workers_in(WorkerState::Pending), vec![0, 1]);

    let started = tokio::time::Instant::now();
    tokio::spawn(orchestrator.run());

    // No assignment leaves Pending before the window resets on the
    // (simulated) clock. No wall-clock timeout here: timers auto-advance
    // under the paused clock and would fire spuriously.
    loop {
        match events.recv().await {
            Ok(event) if matches!(event.kind, WorkerEventKind::Connected) => break,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
    assert!(
        started.elapsed() >= reset_after,
        "first spawn happened {}ms after start, before the {}ms reset window",
        started.elapsed().as_millis(),
        reset_after.as_millis()
    );
    handle.shutdown();
}
