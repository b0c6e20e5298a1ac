//! Local supervisor: workers as child processes
//!
//! Realizes the shard plan by forking worker processes and speaking the
//! control protocol over their stdio pipes. This module has exclusive
//! authority to terminate its children: kills only ever happen inside the
//! link task that owns the `Child`.

use crate::assignment::{AssignmentTable, WorkerState};
use crate::plan::ShardRange;
use crate::proto::Frame;
use crate::supervisor::{arm_startup_timeout, LinkCommand, Links, ShutdownFlag, WorkerSignal};

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of each link's command queue.
const LINK_COMMAND_BUFFER: usize = 8;

/// Spawns and owns local worker processes.
#[derive(Debug, Clone)]
pub struct LocalSupervisor {
    command: String,
    args: Vec<String>,
    table: AssignmentTable,
    links: Links,
    signals: mpsc::Sender<WorkerSignal>,
    timeout: Duration,
    shutdown: ShutdownFlag,
}

impl LocalSupervisor {
    pub fn new(
        command: String,
        args: Vec<String>,
        table: AssignmentTable,
        links: Links,
        signals: mpsc::Sender<WorkerSignal>,
        timeout: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            command,
            args,
            table,
            links,
            signals,
            timeout,
            shutdown,
        }
    }

    /// Spawn the worker process for a Pending assignment, transmit its shard
    /// range, and move it to Starting.
    ///
    /// Spawn failures are reported as a closed link, so they flow into the
    /// respawn policy like any other worker failure.
    pub async fn launch(&self, worker_id: u32) {
        let Some(range) = self.table.range(worker_id) else {
            warn!(worker_id, "Launch requested for unknown worker");
            return;
        };
        if !self
            .table
            .transition(worker_id, &[WorkerState::Pending], WorkerState::Starting)
        {
            debug!(worker_id, "Launch skipped: not Pending");
            return;
        }

        info!(
            worker_id,
            shard_start = range.start,
            shard_end = range.end,
            command = %self.command,
            "Spawning worker process"
        );

        let spawned = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = self
                    .signals
                    .send(WorkerSignal::Closed {
                        worker_id,
                        reason: format!("spawn failed: {e}"),
                    })
                    .await;
                return;
            }
        };

        let Some(mut stdin) = child.stdin.take() else {
            let _ = self
                .signals
                .send(WorkerSignal::Closed {
                    worker_id,
                    reason: "worker stdin unavailable".to_string(),
                })
                .await;
            return;
        };
        let Some(stdout) = child.stdout.take() else {
            let _ = self
                .signals
                .send(WorkerSignal::Closed {
                    worker_id,
                    reason: "worker stdout unavailable".to_string(),
                })
                .await;
            return;
        };

        let assign = Frame::Assign {
            worker_id,
            shard_ids: range.shard_ids().collect(),
            total_shards: self.table.total_shards(),
        };
        if let Err(e) = stdin.write_all(assign.encode().as_bytes()).await {
            let _ = self
                .signals
                .send(WorkerSignal::Closed {
                    worker_id,
                    reason: format!("failed to transmit shard range: {e}"),
                })
                .await;
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(LINK_COMMAND_BUFFER);
        self.links.insert(worker_id, cmd_tx);

        arm_startup_timeout(
            self.table.clone(),
            self.signals.clone(),
            worker_id,
            self.timeout,
        );

        let _ = self.signals.send(WorkerSignal::Attached { worker_id }).await;

        let links = self.links.clone();
        let signals = self.signals.clone();
        let shutdown = self.shutdown.clone();
        let grace = self.timeout;
        tokio::spawn(async move {
            let reason = run_link(worker_id, child, stdin, stdout, cmd_rx, &signals, grace).await;
            links.remove(worker_id);
            if let Some(reason) = reason {
                if !shutdown.is_set() {
                    let _ = signals.send(WorkerSignal::Closed { worker_id, reason }).await;
                }
            }
        });
    }

    /// Launch every Pending assignment. Spawning is parallel: each worker
    /// gets its own task and none blocks another.
    pub fn launch_pending(&self, ranges: &[ShardRange]) {
        for range in ranges {
            let supervisor = self.clone();
            let worker_id = range.worker_id;
            tokio::spawn(async move {
                supervisor.launch(worker_id).await;
            });
        }
    }
}

/// Drive one child's control channel until it closes.
///
/// Returns the closure reason, or None for a deliberate shutdown.
async fn run_link(
    worker_id: u32,
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: tokio::process::ChildStdout,
    mut commands: mpsc::Receiver<LinkCommand>,
    signals: &mpsc::Sender<WorkerSignal>,
    grace: Duration,
) -> Option<String> {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match Frame::decode(&line) {
                    Ok(Frame::Ready) => {
                        let _ = signals.send(WorkerSignal::Ready { worker_id }).await;
                    }
                    Ok(Frame::Pong { seq }) => {
                        let _ = signals.send(WorkerSignal::Pong { worker_id, seq }).await;
                    }
                    Ok(frame) => {
                        debug!(worker_id, ?frame, "Ignoring unexpected frame from worker");
                    }
                    Err(e) => {
                        debug!(worker_id, error = %e, "Undecodable line from worker");
                    }
                },
                Ok(None) => {
                    // Pipe closed; collect the exit status below.
                    let reason = reap(&mut child, grace).await;
                    return Some(reason);
                }
                Err(e) => {
                    let _ = reap(&mut child, grace).await;
                    return Some(format!("control channel read failed: {e}"));
                }
            },
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Ping { seq }) => {
                    if let Err(e) = stdin.write_all(Frame::Ping { seq }.encode().as_bytes()).await {
                        let reason = reap(&mut child, grace).await;
                        return Some(format!("probe write failed ({e}); {reason}"));
                    }
                }
                Some(LinkCommand::Shutdown) | None => {
                    // Deliberate shutdown: ask nicely, then force after grace.
                    let _ = stdin.write_all(Frame::Shutdown.encode().as_bytes()).await;
                    let status = reap(&mut child, grace).await;
                    info!(worker_id, %status, "Worker shut down");
                    return None;
                }
            },
        }
    }
}

/// Wait for exit up to `grace`, then force kill.
async fn reap(child: &mut Child, grace: Duration) -> String {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => format!("process exited: {status}"),
        Ok(Err(e)) => format!("process wait failed: {e}"),
        Err(_) => {
            let _ = child.kill().await;
            "process killed after grace period".to_string()
        }
    }
}
