//! Remote registry: workers as authenticated network peers
//!
//! Listens on a TCP address or Unix socket path and turns inbound
//! connections into worker links. A connection gets no assignment until it
//! proves possession of the shared credential inside the handshake window;
//! this check is the sole defense against an unauthenticated peer injecting
//! shard work.

use crate::assignment::{AssignmentTable, WorkerState};
use crate::config::{ListenTarget, ParkPolicy, Token};
use crate::error::OrchestratorError;
use crate::proto::Frame;
use crate::supervisor::{arm_startup_timeout, LinkCommand, Links, ShutdownFlag, WorkerSignal};

use metrics::counter;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Capacity of each link's command queue.
const LINK_COMMAND_BUFFER: usize = 8;

/// Authenticated peers kept idle while no assignment is Pending.
const PARKED_LIMIT: usize = 16;

type BoxedReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An accepted, not-yet-bound connection.
struct Peer {
    reader: BoxedReader,
    writer: BoxedWriter,
    descr: String,
}

/// Accepts and authenticates inbound worker connections.
#[derive(Clone)]
pub struct RemoteRegistry {
    listen: ListenTarget,
    park: ParkPolicy,
    token: Token,
    table: AssignmentTable,
    links: Links,
    signals: mpsc::Sender<WorkerSignal>,
    timeout: Duration,
    handshake_timeout: Duration,
    shutdown: ShutdownFlag,
    parked: Arc<Mutex<VecDeque<Peer>>>,
}

impl RemoteRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listen: ListenTarget,
        park: ParkPolicy,
        token: Token,
        table: AssignmentTable,
        links: Links,
        signals: mpsc::Sender<WorkerSignal>,
        timeout: Duration,
        handshake_timeout: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            listen,
            park,
            token,
            table,
            links,
            signals,
            timeout,
            handshake_timeout,
            shutdown,
            parked: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Bind the listener and start the accept loop as a background task.
    pub async fn bind(&self) -> Result<(), OrchestratorError> {
        match &self.listen {
            ListenTarget::Tcp { addr, port } => {
                let listener = TcpListener::bind((addr.as_str(), *port))
                    .await
                    .map_err(|source| OrchestratorError::Io {
                        operation: "binding registry listener",
                        source,
                    })?;
                info!(addr = %addr, port, "Remote registry listening");

                let registry = self.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer_addr)) => {
                                if registry.shutdown.is_set() {
                                    break;
                                }
                                let (read, write) = stream.into_split();
                                let peer = Peer {
                                    reader: BufReader::new(
                                        Box::new(read) as Box<dyn AsyncRead + Send + Unpin>
                                    )
                                    .lines(),
                                    writer: Box::new(write),
                                    descr: peer_addr.to_string(),
                                };
                                let registry = registry.clone();
                                tokio::spawn(async move {
                                    registry.handle_connection(peer).await;
                                });
                            }
                            Err(e) => {
                                if registry.shutdown.is_set() {
                                    break;
                                }
                                warn!(error = %e, "Accept failed");
                            }
                        }
                    }
                });
            }
            ListenTarget::Unix(path) => {
                // A stale socket file from a previous run blocks the bind.
                let _ = std::fs::remove_file(path);
                let listener =
                    UnixListener::bind(path).map_err(|source| OrchestratorError::Io {
                        operation: "binding registry socket",
                        source,
                    })?;
                info!(path = %path.display(), "Remote registry listening");

                let registry = self.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                if registry.shutdown.is_set() {
                                    break;
                                }
                                let (read, write) = stream.into_split();
                                let peer = Peer {
                                    reader: BufReader::new(
                                        Box::new(read) as Box<dyn AsyncRead + Send + Unpin>
                                    )
                                    .lines(),
                                    writer: Box::new(write),
                                    descr: "unix".to_string(),
                                };
                                let registry = registry.clone();
                                tokio::spawn(async move {
                                    registry.handle_connection(peer).await;
                                });
                            }
                            Err(e) => {
                                if registry.shutdown.is_set() {
                                    break;
                                }
                                warn!(error = %e, "Accept failed");
                            }
                        }
                    }
                });
            }
        }
        Ok(())
    }

    /// Handshake, then bind the peer to the next Pending assignment.
    async fn handle_connection(&self, mut peer: Peer) {
        let verdict =
            match tokio::time::timeout(self.handshake_timeout, peer.reader.next_line()).await {
                Err(_) => Err("handshake timeout"),
                Ok(Ok(None)) | Ok(Err(_)) => Err("closed before handshake"),
                Ok(Ok(Some(line))) => match Frame::decode(&line) {
                    Ok(Frame::Identify { token }) if self.token.matches(&token) => Ok(()),
                    Ok(Frame::Identify { .. }) => Err("credential mismatch"),
                    _ => Err("malformed handshake"),
                },
            };

        if let Err(reason) = verdict {
            warn!(peer = %peer.descr, reason, "Handshake rejected");
            counter!("orchestrator_handshake_rejected_total", "reason" => reason).increment(1);
            // Dropping the peer closes the connection; it never saw an
            // assignment.
            return;
        }

        debug!(peer = %peer.descr, "Peer authenticated");
        self.bind_peer(peer).await;
    }

    /// Attach an authenticated peer to the lowest-id Pending assignment, or
    /// park/close it when none exists.
    async fn bind_peer(&self, peer: Peer) {
        loop {
            let Some(worker_id) = self.table.next_pending() else {
                break;
            };
            if self
                .table
                .transition(worker_id, &[WorkerState::Pending], WorkerState::Starting)
            {
                self.attach(worker_id, peer).await;
                return;
            }
            // Lost the race for that id; try the next Pending one.
        }

        match self.park {
            ParkPolicy::Park => {
                let mut parked = self.parked.lock().await;
                if parked.len() >= PARKED_LIMIT {
                    warn!(peer = %peer.descr, "Parking queue full, closing peer");
                    return;
                }
                debug!(peer = %peer.descr, "No Pending assignment, parking peer");
                parked.push_back(peer);
            }
            ParkPolicy::Close => {
                debug!(peer = %peer.descr, "No Pending assignment, closing peer");
            }
        }
    }

    /// Re-acquire a range that re-entered Pending, using a parked peer if
    /// one is available. Without one, the assignment stays Pending until the
    /// next inbound connection.
    pub async fn adopt(&self, worker_id: u32) {
        let peer = self.parked.lock().await.pop_front();
        let Some(peer) = peer else {
            debug!(worker_id, "No parked peer; awaiting inbound connection");
            return;
        };
        if self
            .table
            .transition(worker_id, &[WorkerState::Pending], WorkerState::Starting)
        {
            self.attach(worker_id, peer).await;
        } else {
            // Not Pending anymore; put the peer back.
            self.parked.lock().await.push_front(peer);
        }
    }

    /// Send the shard range and start the link task. The assignment is
    /// already Starting.
    async fn attach(&self, worker_id: u32, mut peer: Peer) {
        let Some(range) = self.table.range(worker_id) else {
            warn!(worker_id, "Attach requested for unknown worker");
            return;
        };

        let assign = Frame::Assign {
            worker_id,
            shard_ids: range.shard_ids().collect(),
            total_shards: self.table.total_shards(),
        };
        if let Err(e) = peer.writer.write_all(assign.encode().as_bytes()).await {
            let _ = self
                .signals
                .send(WorkerSignal::Closed {
                    worker_id,
                    reason: format!("failed to transmit shard range: {e}"),
                })
                .await;
            return;
        }

        info!(
            worker_id,
            peer = %peer.descr,
            shard_start = range.start,
            shard_end = range.end,
            "Peer bound to assignment"
        );

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
        tokio::spawn(async move {
            let reason = run_link(worker_id, peer, cmd_rx, &signals).await;
            links.remove(worker_id);
            if let Some(reason) = reason {
                if !shutdown.is_set() {
                    let _ = signals.send(WorkerSignal::Closed { worker_id, reason }).await;
                }
            }
        });
    }
}

/// Drive one peer's control channel until it closes.
///
/// Returns the closure reason, or None for a deliberate shutdown.
async fn run_link(
    worker_id: u32,
    mut peer: Peer,
    mut commands: mpsc::Receiver<LinkCommand>,
    signals: &mpsc::Sender<WorkerSignal>,
) -> Option<String> {
    loop {
        tokio::select! {
            line = peer.reader.next_line() => match line {
                Ok(Some(line)) => match Frame::decode(&line) {
                    Ok(Frame::Ready) => {
                        let _ = signals.send(WorkerSignal::Ready { worker_id }).await;
                    }
                    Ok(Frame::Pong { seq }) => {
                        let _ = signals.send(WorkerSignal::Pong { worker_id, seq }).await;
                    }
                    Ok(frame) => {
                        debug!(worker_id, ?frame, "Ignoring unexpected frame from peer");
                    }
                    Err(e) => {
                        debug!(worker_id, error = %e, "Undecodable line from peer");
                    }
                },
                Ok(None) => return Some("connection closed by peer".to_string()),
                Err(e) => return Some(format!("connection read failed: {e}")),
            },
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Ping { seq }) => {
                    if let Err(e) = peer.writer.write_all(Frame::Ping { seq }.encode().as_bytes()).await {
                        return Some(format!("probe write failed: {e}"));
                    }
                }
                Some(LinkCommand::Shutdown) | None => {
                    let _ = peer.writer.write_all(Frame::Shutdown.encode().as_bytes()).await;
                    let _ = peer.writer.shutdown().await;
                    info!(worker_id, "Peer link shut down");
                    return None;
                }
            },
        }
    }
}
